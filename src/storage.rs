//! On-disk content engine.
//!
//! Maps a torrent's contiguous byte space onto real files, absorbs
//! out-of-order writes into staging files, and merges staged bytes back
//! into the real files as their written prefixes catch up.
//!
//! # Overview
//!
//! Peers deliver pieces in arbitrary order, but real files are grown as
//! dense prefixes. A write that lands past a file's written prefix goes to
//! a staging file instead; once the prefix reaches the staged offset, the
//! merge engine splices the staged bytes in and deletes the staging
//! artifact. File handles are served through an LRU cache bounded at
//! [`crate::constants::MAX_OPEN_FILES`].
//!
//! # Components
//!
//! - [`ContentEngine`] - the engine: chain, dispatcher, merge, recovery
//! - [`ContentOptions`] - build-time configuration
//! - [`AllocationMode`] - preallocation policy (`None` | `Sparse` | `Full`)
//! - [`MergeMode`] - one merge vs. exhaustive merge pass
//! - [`StorageError`] - everything that can go wrong on disk
//!
//! # Example
//!
//! ```no_run
//! use piecestore::storage::{ContentEngine, ContentOptions, MergeMode};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let meta = std::fs::read("example.torrent")?;
//! let options = ContentOptions::new("/var/lib/bt/staging");
//! let mut engine = ContentEngine::from_metainfo(&meta, "abcd1234", 262144, options)?;
//!
//! engine.setup().await?;
//! let present = engine.create_files().await?;
//! println!("{} pieces already on disk", present.count());
//!
//! engine.write(0, b"hello").await?;
//! if engine.need_merge() {
//!     engine.find_and_merge(MergeMode::All).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! Paths declared by torrent metadata are validated before use: absolute
//! paths and `..` components are rejected, and non-printable bytes can be
//! rewritten to a hex form.

mod allocate;
mod chain;
mod engine;
mod error;
mod handles;
mod io;
mod merge;
mod paths;
mod picks;
mod recover;

pub use allocate::AllocationMode;
pub use engine::{ContentEngine, ContentOptions};
pub use error::StorageError;
pub use merge::MergeMode;

#[cfg(test)]
mod tests;
