// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

use rstest::rstest;

use super::{
    EntryType, HeaderError, fold_pax_records, parse_numeric, parse_octal, parse_pax_records,
    parse_pax_time, pax,
};

#[rstest]
#[case(b"0000644\0", 0o644)]
#[case(b"   17\0  ", 0o17)]
#[case(b"\0\0\0\0\0\0\0\0", 0)]
#[case(b"00000000000\0", 0)]
fn test_parse_octal(#[case] field: &[u8], #[case] expected: i64) {
    assert_eq!(parse_octal(field).unwrap(), expected);
}

#[rstest]
fn test_parse_octal_rejects_garbage() {
    assert!(matches!(
        parse_octal(b"0a0\0"),
        Err(HeaderError::Numeric)
    ));
}

#[rstest]
fn test_parse_numeric_base256() {
    // 12-byte field with the high bit set reads as big-endian binary
    let mut field = [0u8; 12];
    field[0] = 0x80;
    field[11] = 0x01;
    assert_eq!(parse_numeric(&field).unwrap(), 1);

    field[10] = 0x01;
    assert_eq!(parse_numeric(&field).unwrap(), 257);

    // all-ones is negative one in two's complement
    let field = [0xffu8; 12];
    assert_eq!(parse_numeric(&field).unwrap(), -1);
}

#[rstest]
fn test_parse_numeric_base256_overflow() {
    let mut field = [0xffu8; 12];
    field[0] = 0x80;
    assert!(matches!(
        parse_numeric(&field),
        Err(HeaderError::Overflow)
    ));
}

#[rstest]
fn test_parse_numeric_falls_back_to_octal() {
    assert_eq!(parse_numeric(b"0000000000\0 ").unwrap(), 0);
    assert_eq!(parse_numeric(b"00000000017\0").unwrap(), 0o17);
}

#[rstest]
fn test_parse_pax_records() {
    let data = b"30 mtime=1350244992.023960108\n";
    let records = parse_pax_records(data).unwrap();
    assert_eq!(
        records,
        vec![("mtime".to_string(), "1350244992.023960108".to_string())]
    );

    let data = b"12 path=a/b\n19 linkpath=target\n";
    let records = parse_pax_records(data).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], ("path".to_string(), "a/b".to_string()));
    assert_eq!(records[1], ("linkpath".to_string(), "target".to_string()));
}

#[rstest]
#[case(b"8 path=x\n" as &[u8])] // record length does not cover the newline
#[case(b"x path=a\n" as &[u8])]
#[case(b"12 pathvalue\n" as &[u8])]
fn test_parse_pax_records_malformed(#[case] data: &[u8]) {
    assert!(parse_pax_records(data).is_err());
}

#[rstest]
fn test_fold_pax_records_builds_sparse_map() {
    let records = vec![
        ("GNU.sparse.size".to_string(), "12".to_string()),
        (pax::GNU_SPARSE_OFFSET.to_string(), "0".to_string()),
        (pax::GNU_SPARSE_NUMBYTES.to_string(), "4".to_string()),
        (pax::GNU_SPARSE_OFFSET.to_string(), "8".to_string()),
        (pax::GNU_SPARSE_NUMBYTES.to_string(), "4".to_string()),
    ];
    let map = fold_pax_records(records).unwrap();
    assert_eq!(map.get(pax::GNU_SPARSE_MAP).unwrap(), "0,4,8,4");
    assert_eq!(map.get("GNU.sparse.size").unwrap(), "12");
}

#[rstest]
fn test_fold_pax_records_rejects_commas_in_pairs() {
    let records = vec![(pax::GNU_SPARSE_OFFSET.to_string(), "1,2".to_string())];
    assert!(fold_pax_records(records).is_err());
}

#[rstest]
fn test_parse_pax_time() {
    let time = parse_pax_time("1350244992").unwrap();
    assert_eq!(time.timestamp(), 1350244992);

    let time = parse_pax_time("1350244992.5").unwrap();
    assert_eq!(time.timestamp_subsec_nanos(), 500_000_000);

    assert!(parse_pax_time("not-a-time").is_err());
}

#[rstest]
#[case(b'0', EntryType::Regular)]
#[case(b'\0', EntryType::Regular)]
#[case(b'7', EntryType::Regular)]
#[case(b'1', EntryType::HardLink)]
#[case(b'2', EntryType::Symlink)]
#[case(b'5', EntryType::Directory)]
#[case(b'S', EntryType::GnuSparse)]
#[case(b'x', EntryType::ExtendedHeader)]
#[case(b'g', EntryType::GlobalExtendedHeader)]
#[case(b'L', EntryType::GnuLongName)]
#[case(b'K', EntryType::GnuLongLink)]
#[case(b'Z', EntryType::Other(b'Z'))]
fn test_entry_type_flags(#[case] flag: u8, #[case] expected: EntryType) {
    assert_eq!(EntryType::from_flag(flag), expected);
}
