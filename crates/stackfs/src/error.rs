// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/stackfs

use thiserror::Error;

#[cfg(test)]
#[path = "./error_test.rs"]
mod error_test;

/// Classifies every failure surfaced by the filesystem engines.
///
/// Callers are expected to discriminate on this kind via [`Error::kind`]
/// or [`Error::is`], never on rendered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    #[strum(serialize = "entry does not exist")]
    NotExist,
    #[strum(serialize = "entry already exists")]
    Exist,
    #[strum(serialize = "not a directory")]
    NotDir,
    #[strum(serialize = "is a directory")]
    IsDir,
    #[strum(serialize = "directory not empty")]
    NotEmpty,
    #[strum(serialize = "invalid argument")]
    Invalid,
    #[strum(serialize = "handle already closed")]
    Closed,
    #[strum(serialize = "permission denied")]
    Permission,
    #[strum(serialize = "read-only filesystem")]
    ReadOnlyFs,
    #[strum(serialize = "bad file handle")]
    BadFd,
    #[strum(serialize = "too many levels of symbolic links")]
    TooManyLinks,
    #[strum(serialize = "path escapes from root")]
    PathEscapes,
    #[strum(serialize = "entry type not supported")]
    TypeNotSupported,
    #[strum(serialize = "invalid tar header")]
    BadTarHeader,
    #[strum(serialize = "entry is whited out")]
    WhitedOut,
    /// A foreign I/O failure from a backing source, preserved as the
    /// error's source chain.
    #[strum(serialize = "i/o error")]
    Io,
}

/// A structured filesystem failure: the operation that failed, the path it
/// failed on, and the [`ErrorKind`] classifying why.
#[derive(Debug, Error)]
#[error("{op} {path}: {kind}")]
pub struct Error {
    op: &'static str,
    path: String,
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(op: &'static str, path: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            op,
            path: path.into(),
            kind,
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Wrap a foreign I/O error, adopting its kind where one of ours
    /// corresponds to it.
    pub fn io(op: &'static str, path: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match err.kind() {
            IoKind::NotFound => ErrorKind::NotExist,
            IoKind::AlreadyExists => ErrorKind::Exist,
            IoKind::PermissionDenied => ErrorKind::Permission,
            IoKind::InvalidInput => ErrorKind::Invalid,
            _ => ErrorKind::Io,
        };
        Self::new(op, path, kind).with_source(err)
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// The closest errno for this failure, for callers bridging into
    /// OS-level error reporting.
    pub fn os_error(&self) -> i32 {
        match self.kind {
            ErrorKind::NotExist | ErrorKind::WhitedOut => libc::ENOENT,
            ErrorKind::Exist => libc::EEXIST,
            ErrorKind::NotDir => libc::ENOTDIR,
            ErrorKind::IsDir => libc::EISDIR,
            ErrorKind::NotEmpty => libc::ENOTEMPTY,
            ErrorKind::Invalid | ErrorKind::BadTarHeader => libc::EINVAL,
            ErrorKind::Closed | ErrorKind::BadFd => libc::EBADF,
            ErrorKind::Permission => libc::EPERM,
            ErrorKind::ReadOnlyFs => libc::EROFS,
            ErrorKind::TooManyLinks => libc::ELOOP,
            ErrorKind::PathEscapes => libc::EXDEV,
            ErrorKind::TypeNotSupported => libc::ENOTSUP,
            ErrorKind::Io => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
