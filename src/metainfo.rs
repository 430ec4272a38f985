//! Torrent metadata adapter.
//!
//! Reads the fields of the `info` dictionary that describe the content
//! layout (`name`, plus `length` for single-file torrents or `files` for
//! multi-file torrents) and hands them to the storage layer as raw bytes.
//! Path components stay as bytes here; sanitizing and normalizing them is
//! the storage layer's job.

mod error;
mod layout;

pub use error::MetainfoError;
pub use layout::{parse_content, ContentMeta, FileMeta, FileScheme};
