use std::io;

use thiserror::Error;

use crate::metainfo::MetainfoError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] MetainfoError),

    #[error("unsafe path \"{0}\" in torrent data")]
    InvalidPath(String),

    #[error("invalid existing file \"{path}\": {reason}")]
    InvalidExistingFile { path: String, reason: String },

    #[error("data offset {offset} length {length} out of range")]
    OutOfRange { offset: u64, length: u64 },

    #[error("no file covers offset {0}")]
    GapRead(u64),

    #[error("read failed on \"{path}\": {source}")]
    ReadFailed { path: String, source: io::Error },

    #[error("write or flush failed on \"{path}\": {source}")]
    WriteFailed { path: String, source: io::Error },

    #[error("open-file budget exhausted with nothing left to close")]
    OutOfHandles,

    #[error("no space left on device for \"{0}\"")]
    OutOfSpace(String),

    #[error("assembled path too long: \"{0}\"")]
    NameTooLong(String),
}

/// EMFILE/ENFILE: the process or system is out of file descriptors.
pub(crate) fn is_handle_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// ENOSPC, including the case where a directory cannot grow.
pub(crate) fn is_disk_full(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSPC) || err.kind() == io::ErrorKind::StorageFull
}
