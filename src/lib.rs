//! piecestore - the on-disk content engine of a BitTorrent client
//!
//! Maps a torrent's contiguous byte space onto real files, absorbs
//! out-of-order writes through staging files, merges staged bytes back as
//! contiguous prefixes accumulate, and serves everything through a bounded
//! open-file budget.
//!
//! # Modules
//!
//! - [`storage`] - the engine: file chain, I/O dispatch, merge, recovery
//! - [`metainfo`] - layout fields of the torrent `info` dictionary
//! - [`bencode`] - BEP-3 bencode decoding/encoding
//! - [`bitfield`] - piece bitfields in wire order
//! - [`clock`] - injectable monotonic time source
//! - [`constants`] - engine constants and tuning parameters

pub mod bencode;
pub mod bitfield;
pub mod clock;
pub mod constants;
pub mod metainfo;
pub mod storage;

pub use bencode::{decode, encode, BencodeError, Value};
pub use bitfield::Bitfield;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use metainfo::{parse_content, ContentMeta, FileMeta, FileScheme, MetainfoError};
pub use storage::{AllocationMode, ContentEngine, ContentOptions, MergeMode, StorageError};
