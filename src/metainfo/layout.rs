use bytes::Bytes;

use super::error::MetainfoError;
use crate::bencode::{decode, Value};

/// Content layout declared by a torrent's `info` dictionary.
#[derive(Debug, Clone)]
pub struct ContentMeta {
    /// Declared name: the file name for single-file torrents, the
    /// directory name for multi-file torrents. Raw bytes; not yet
    /// sanitized.
    pub name: Bytes,
    pub scheme: FileScheme,
}

/// Single-file vs multi-file layout.
#[derive(Debug, Clone)]
pub enum FileScheme {
    Single { length: u64 },
    Multi { files: Vec<FileMeta> },
}

/// One entry of a multi-file `info|files` list.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Path components below the torrent directory, raw bytes each.
    pub path: Vec<Bytes>,
    pub length: u64,
}

impl ContentMeta {
    /// Total declared content length.
    pub fn total_length(&self) -> u64 {
        match &self.scheme {
            FileScheme::Single { length } => *length,
            FileScheme::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }
}

/// Parses the content layout out of a complete bencoded metadata buffer.
///
/// Only `info|name`, `info|length`, and `info|files` are consumed. A
/// buffer declaring both `length` and `files` is contradictory and
/// rejected.
pub fn parse_content(meta: &[u8]) -> Result<ContentMeta, MetainfoError> {
    let root = decode(meta)?;
    let info = root
        .get(b"info")
        .ok_or(MetainfoError::MissingField("info"))?;
    if info.as_dict().is_none() {
        return Err(MetainfoError::InvalidField("info"));
    }

    let name = info
        .get(b"name")
        .and_then(Value::as_bytes)
        .ok_or(MetainfoError::MissingField("info|name"))?
        .clone();

    let length = info.get(b"length");
    let files = info.get(b"files");

    let scheme = match (length, files) {
        (Some(_), Some(_)) => return Err(MetainfoError::ConflictingLayout),
        (Some(length), None) => FileScheme::Single {
            length: as_length(length, "info|length")?,
        },
        (None, Some(files)) => FileScheme::Multi {
            files: parse_files(files)?,
        },
        (None, None) => return Err(MetainfoError::MissingField("info|length or info|files")),
    };

    Ok(ContentMeta { name, scheme })
}

fn parse_files(files: &Value) -> Result<Vec<FileMeta>, MetainfoError> {
    let list = files
        .as_list()
        .ok_or(MetainfoError::InvalidField("info|files"))?;

    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let length = entry
            .get(b"length")
            .ok_or(MetainfoError::MissingField("info|files|length"))?;
        let path = entry
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or(MetainfoError::MissingField("info|files|path"))?;

        let components: Vec<Bytes> = path
            .iter()
            .map(|c| {
                c.as_bytes()
                    .cloned()
                    .ok_or(MetainfoError::InvalidField("info|files|path"))
            })
            .collect::<Result<_, _>>()?;
        if components.is_empty() {
            return Err(MetainfoError::InvalidField("info|files|path"));
        }

        out.push(FileMeta {
            path: components,
            length: as_length(length, "info|files|length")?,
        });
    }
    Ok(out)
}

fn as_length(value: &Value, field: &'static str) -> Result<u64, MetainfoError> {
    let n = value
        .as_integer()
        .ok_or(MetainfoError::InvalidField(field))?;
    u64::try_from(n).map_err(|_| MetainfoError::InvalidField(field))
}
