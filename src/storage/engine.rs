//! The content engine: owns the file chain, the open-file cache, and the
//! write-failure backoff state. I/O dispatch, merging, allocation, and
//! recovery live in the sibling modules as further `impl` blocks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::fs;
use tracing::warn;

use super::allocate::AllocationMode;
use super::chain::{Chain, Node, NodeId};
use super::error::{is_disk_full, is_handle_exhaustion, StorageError};
use super::handles::{OpenCache, OpenMode};
use super::paths;
use crate::bencode::Value;
use crate::bitfield::Bitfield;
use crate::clock::{Clock, MonotonicClock};
use crate::constants::MAX_OPEN_FILES;
use crate::metainfo::{parse_content, FileScheme};

/// Build-time configuration for a [`ContentEngine`].
#[derive(Debug, Clone)]
pub struct ContentOptions {
    /// Root under which per-torrent staging subtrees live.
    pub staging_dir: PathBuf,
    /// Preallocation policy for real files.
    pub allocate: AllocationMode,
    /// Rewrite non-printable bytes in torrent-declared names.
    pub convert_filenames: bool,
    /// Restrict allocation and piece interest to one logical file.
    pub file_to_download: Option<usize>,
    /// Destination path overriding the torrent-declared name.
    pub save_as: Option<PathBuf>,
}

impl ContentOptions {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            allocate: AllocationMode::default(),
            convert_filenames: false,
            file_to_download: None,
            save_as: None,
        }
    }

    pub fn allocate(mut self, mode: AllocationMode) -> Self {
        self.allocate = mode;
        self
    }

    pub fn convert_filenames(mut self, convert: bool) -> Self {
        self.convert_filenames = convert;
        self
    }

    pub fn file_to_download(mut self, file: Option<usize>) -> Self {
        self.file_to_download = file;
        self
    }

    pub fn save_as(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_as = Some(path.into());
        self
    }
}

/// On-disk content engine for one torrent.
///
/// Single-owner and cooperative: every operation takes `&mut self`, so the
/// engine carries no locks. Await points are the only suspension points.
pub struct ContentEngine {
    pub(crate) chain: Chain,
    /// Real nodes in chain order, for index-based lookups.
    pub(crate) files: Vec<NodeId>,
    /// Present for multi-file torrents; real-file paths are relative to it.
    pub(crate) directory: Option<PathBuf>,
    pub(crate) total_length: u64,
    pub(crate) piece_length: u64,
    pub(crate) npieces: usize,
    /// Decimal width of `total_length`; staging names are padded to it.
    pub(crate) offset_width: usize,
    pub(crate) torrent_id: String,
    /// `<staging_dir>/<torrent_id>`.
    pub(crate) staging_root: PathBuf,
    /// Active staging subdirectory name, if any.
    pub(crate) stagedir: Option<String>,
    /// Staging files created in the active subdirectory.
    pub(crate) stagecount: usize,
    pub(crate) cache: OpenCache,
    pub(crate) allocate: AllocationMode,
    pub(crate) needs_merge: bool,
    pub(crate) write_failed: bool,
    pub(crate) write_tried: Option<Instant>,
    /// Pieces NOT wanted when a single file is selected for download.
    pub(crate) download_filter: Option<Bitfield>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl ContentEngine {
    /// Builds the engine from a bencoded metadata buffer.
    ///
    /// Only the layout fields of the `info` dictionary are consumed; the
    /// piece length is owned by the verification layer and passed in.
    pub fn from_metainfo(
        meta: &[u8],
        torrent_id: &str,
        piece_length: u64,
        options: ContentOptions,
    ) -> Result<Self, StorageError> {
        let content = parse_content(meta)?;
        let mut chain = Chain::new();
        let mut files = Vec::new();
        let mut directory = None;
        let mut offset = 0u64;

        match &content.scheme {
            FileScheme::Single { length } => {
                let path = match &options.save_as {
                    Some(path) => path.clone(),
                    None => paths::normalize(&content.name, options.convert_filenames)?,
                };
                let pieces = count_pieces(0, *length, piece_length);
                files.push(chain.append_real(Node::real(path, 0, *length, pieces)));
                offset = *length;
            }
            FileScheme::Multi { files: metas } => {
                directory = Some(match &options.save_as {
                    Some(path) => path.clone(),
                    None => paths::normalize(&content.name, options.convert_filenames)?,
                });
                for meta in metas {
                    let mut joined = Vec::new();
                    for comp in &meta.path {
                        paths::check_component(comp)?;
                        if !joined.is_empty() {
                            joined.push(b'/');
                        }
                        joined.extend_from_slice(comp);
                    }
                    let path = paths::normalize(&joined, options.convert_filenames)?;
                    let pieces = count_pieces(offset, meta.length, piece_length);
                    files.push(chain.append_real(Node::real(path, offset, meta.length, pieces)));
                    offset += meta.length;
                }
            }
        }

        Ok(Self::assemble(
            chain, files, directory, offset, torrent_id, piece_length, options,
        ))
    }

    /// Builds the engine over existing content: a single file, or a
    /// directory tree scanned recursively in name order. This is the
    /// seeding path; sizes are taken from disk and equal the lengths.
    pub async fn from_directory(
        path: &Path,
        torrent_id: &str,
        piece_length: u64,
        options: ContentOptions,
    ) -> Result<Self, StorageError> {
        let meta = fs::metadata(path).await?;
        let mut chain = Chain::new();
        let mut files = Vec::new();
        let mut directory = None;
        let mut offset = 0u64;

        if meta.is_file() {
            let pieces = count_pieces(0, meta.len(), piece_length);
            let id = chain.append_real(Node::real(path.to_path_buf(), 0, meta.len(), pieces));
            chain.node_mut(id).size = meta.len();
            files.push(id);
            offset = meta.len();
        } else if meta.is_dir() {
            directory = Some(path.to_path_buf());
            let mut found = Vec::new();
            scan_tree(path, PathBuf::new(), &mut found).await?;
            for (rel, len) in found {
                let pieces = count_pieces(offset, len, piece_length);
                let id = chain.append_real(Node::real(rel, offset, len, pieces));
                chain.node_mut(id).size = len;
                files.push(id);
                offset += len;
            }
        } else {
            return Err(StorageError::InvalidExistingFile {
                path: path.to_string_lossy().into_owned(),
                reason: "not a directory or regular file".into(),
            });
        }

        Ok(Self::assemble(
            chain, files, directory, offset, torrent_id, piece_length, options,
        ))
    }

    fn assemble(
        chain: Chain,
        files: Vec<NodeId>,
        directory: Option<PathBuf>,
        total_length: u64,
        torrent_id: &str,
        piece_length: u64,
        options: ContentOptions,
    ) -> Self {
        debug_assert!(piece_length > 0);
        let npieces = if total_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length) as usize
        };
        let mut engine = Self {
            chain,
            files,
            directory,
            total_length,
            piece_length,
            npieces,
            offset_width: total_length.to_string().len(),
            torrent_id: torrent_id.to_owned(),
            staging_root: options.staging_dir.join(torrent_id),
            stagedir: None,
            stagecount: 0,
            cache: OpenCache::new(MAX_OPEN_FILES),
            allocate: options.allocate,
            needs_merge: false,
            write_failed: false,
            write_tried: None,
            download_filter: None,
            clock: Arc::new(MonotonicClock),
        };
        engine.set_download_filter(options.file_to_download);
        engine
    }

    /// Replaces the engine's time source. Useful for tests and hosts that
    /// drive time themselves.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Restricts allocation and piece interest to `file`, or clears the
    /// restriction.
    pub fn set_download_filter(&mut self, file: Option<usize>) {
        match file {
            Some(index) => {
                let mut filter = Bitfield::new(self.npieces);
                self.set_filter(index, &mut filter, self.piece_length);
                self.download_filter = Some(filter);
            }
            None => self.download_filter = None,
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.npieces
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Relative path of file `index`.
    pub fn file_name(&self, index: usize) -> Option<&Path> {
        let id = *self.files.get(index)?;
        self.chain.node(id).as_real().map(|r| r.path.as_path())
    }

    /// Declared length of file `index`.
    pub fn file_size(&self, index: usize) -> u64 {
        self.files
            .get(index)
            .and_then(|&id| self.chain.node(id).as_real())
            .map_or(0, |r| r.length)
    }

    /// Number of pieces intersecting file `index`.
    pub fn file_pieces(&self, index: usize) -> usize {
        self.files
            .get(index)
            .and_then(|&id| self.chain.node(id).as_real())
            .map_or(0, |r| r.piece_count)
    }

    /// The destination the torrent materializes under: the directory for
    /// multi-file torrents, the single file's path otherwise.
    pub fn data_name(&self) -> &Path {
        match &self.directory {
            Some(dir) => dir.as_path(),
            None => self
                .files
                .first()
                .and_then(|&id| self.chain.node(id).as_real())
                .map(|r| r.path.as_path())
                .unwrap_or_else(|| Path::new("")),
        }
    }

    /// Number of currently open file handles.
    pub fn open_files(&self) -> usize {
        self.cache.open_count()
    }

    /// A printable listing of the torrent's files, with per-file
    /// completion when the completed-pieces bitfield is supplied.
    pub fn summary(&self, completed: Option<&Bitfield>) -> String {
        let mut out = String::from("FILES INFO\n");
        if let Some(dir) = &self.directory {
            out.push_str(&format!("Directory: {}\n", dir.display()));
        }
        for (index, &id) in self.files.iter().enumerate() {
            let Some(real) = self.chain.node(id).as_real() else {
                continue;
            };
            out.push_str(&format!(
                "<{}> {} [{}]",
                index + 1,
                real.path.display(),
                real.length
            ));
            if let Some(done) = completed {
                let mut filter = Bitfield::new(self.npieces);
                self.set_filter(index, &mut filter, self.piece_length);
                let mut have = done.clone();
                have.except(&filter);
                let pct = if real.piece_count > 0 {
                    100 * have.count() / real.piece_count
                } else {
                    100
                };
                out.push_str(&format!(" {}/{} ({}%)", have.count(), real.piece_count, pct));
            }
            out.push('\n');
        }
        out.push_str(&format!("Total: {} MB\n", self.total_length / 1024 / 1024));
        out
    }

    /// Emits the layout fields of a bencoded `info` dictionary under
    /// construction: `files` + `name` for multi-file, `length` + `name`
    /// for single-file. Canonical key order comes from the map itself.
    pub fn fill_meta_info(&self, info: &mut BTreeMap<Bytes, Value>) -> Result<(), StorageError> {
        let data_name = self.data_name();
        let refname = data_name
            .file_name()
            .map(|n| n.as_encoded_bytes().to_vec())
            .filter(|n| !n.is_empty() && n != b"." && n[0] != b'/')
            .ok_or_else(|| {
                StorageError::InvalidPath(data_name.to_string_lossy().into_owned())
            })?;

        if self.directory.is_some() {
            let mut entries = Vec::with_capacity(self.files.len());
            for &id in &self.files {
                let Some(real) = self.chain.node(id).as_real() else {
                    continue;
                };
                let components: Vec<Value> = real
                    .path
                    .components()
                    .filter_map(|c| match c {
                        std::path::Component::Normal(os) => Some(Value::Bytes(
                            Bytes::copy_from_slice(os.as_encoded_bytes()),
                        )),
                        _ => None,
                    })
                    .collect();
                let mut entry = BTreeMap::new();
                entry.insert(
                    Bytes::from_static(b"length"),
                    Value::Integer(real.length as i64),
                );
                entry.insert(Bytes::from_static(b"path"), Value::List(components));
                entries.push(Value::Dict(entry));
            }
            info.insert(Bytes::from_static(b"files"), Value::List(entries));
        } else {
            info.insert(
                Bytes::from_static(b"length"),
                Value::Integer(self.file_size(0) as i64),
            );
        }
        info.insert(
            Bytes::from_static(b"name"),
            Value::Bytes(Bytes::from(refname)),
        );
        Ok(())
    }

    /// Flushes and drops every handle, and removes the per-torrent staging
    /// root when nothing is staged under it anymore.
    pub async fn close(&mut self) {
        self.cache.close_all().await;
        if let Ok(mut entries) = fs::read_dir(&self.staging_root).await {
            if let Ok(None) = entries.next_entry().await {
                tracing::debug!("remove dir \"{}\"", self.staging_root.display());
                if let Err(e) = fs::remove_dir(&self.staging_root).await {
                    warn!(
                        "remove directory \"{}\" failed: {}",
                        self.staging_root.display(),
                        e
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared internals
    // ------------------------------------------------------------------

    /// Absolute on-disk path of a chain node.
    pub(crate) fn node_path(&self, id: NodeId) -> PathBuf {
        let node = self.chain.node(id);
        match &node.kind {
            super::chain::NodeKind::Staging(s) => self.staging_root.join(&s.name),
            super::chain::NodeKind::Real(r) => match &self.directory {
                Some(dir) => dir.join(&r.path),
                None => r.path.clone(),
            },
        }
    }

    /// Opens a node in the given mode, creating parent directories for
    /// writes and evicting under the handle budget. No merge fallback;
    /// used by merge and allocation, which must not re-enter the merge
    /// engine.
    pub(crate) async fn open_plain(
        &mut self,
        id: NodeId,
        mode: OpenMode,
    ) -> Result<(), StorageError> {
        let path = self.node_path(id);
        if path.as_os_str().len() > crate::constants::MAX_PATH_LEN {
            return Err(StorageError::NameTooLong(
                path.to_string_lossy().into_owned(),
            ));
        }
        let now = self.clock.now();
        if self.cache.usable(id, mode) {
            self.cache.touch(id, now);
            return Ok(());
        }
        if self.cache.is_open(id) {
            // read-only handle asked to serve a write
            self.cache.close(id, &path).await;
        }
        if mode == OpenMode::ReadWrite {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        if self.cache.at_budget() {
            self.close_oldest_node().await?;
        }
        match self.cache.open(id, &path, mode, now).await {
            Err(StorageError::Io(e)) if is_handle_exhaustion(&e) => {
                self.close_oldest_node().await?;
                self.cache.open(id, &path, mode, now).await
            }
            other => other,
        }
    }

    /// Closes the least-recently-used open node. On a timestamp tie the
    /// node earliest in the chain wins.
    pub(crate) async fn close_oldest_node(&mut self) -> Result<(), StorageError> {
        let mut victim: Option<(NodeId, Instant)> = None;
        let mut cur = self.chain.head();
        while let Some(id) = cur {
            if let Some(at) = self.cache.last_used(id) {
                if victim.is_none_or(|(_, oldest)| at < oldest) {
                    victim = Some((id, at));
                }
            }
            cur = self.chain.node(id).next;
        }
        match victim {
            Some((id, _)) => {
                self.close_node(id).await;
                Ok(())
            }
            None => Err(StorageError::OutOfHandles),
        }
    }

    /// Opens a node for the data path. On ENOSPC (a full staging
    /// directory counts) one merge is attempted anywhere in the chain to
    /// free staged data, then the open is retried once.
    pub(crate) async fn open_for_io(
        &mut self,
        id: NodeId,
        mode: OpenMode,
    ) -> Result<(), StorageError> {
        match self.open_plain(id, mode).await {
            Err(StorageError::Io(e)) if is_disk_full(&e) => {
                warn!("open failed with no space; trying a merge to free staged data");
                self.merge_any().await;
                if !self.chain.exists(id) {
                    // the merge consumed this very staging node
                    return Err(StorageError::OutOfSpace(format!("node {id}")));
                }
                match self.open_plain(id, mode).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.write_failed = true;
                        self.write_tried = Some(self.clock.now());
                        match err {
                            StorageError::Io(e) if is_disk_full(&e) => Err(
                                StorageError::OutOfSpace(self.node_path(id).display().to_string()),
                            ),
                            other => Err(other),
                        }
                    }
                }
            }
            other => other,
        }
    }

    pub(crate) async fn close_node(&mut self, id: NodeId) {
        let path = self.node_path(id);
        self.cache.close(id, &path).await;
    }
}

/// Pieces intersecting `[offset, offset + length)`. A file ending exactly
/// on a piece boundary does not claim the boundary piece.
pub(crate) fn count_pieces(offset: u64, length: u64, piece_length: u64) -> usize {
    if length == 0 {
        return 0;
    }
    let start = offset / piece_length;
    let mut stop = (offset + length) / piece_length;
    if stop > start && (offset + length) % piece_length == 0 {
        stop -= 1;
    }
    (stop - start + 1) as usize
}

/// Collects `(relative_path, length)` for every regular file under
/// `root/rel`, recursing into subdirectories, entries sorted by name.
fn scan_tree<'a>(
    root: &'a Path,
    rel: PathBuf,
    out: &'a mut Vec<(PathBuf, u64)>,
) -> BoxFuture<'a, Result<(), StorageError>> {
    async move {
        let dir = root.join(&rel);
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();

        for name in names {
            let rel_child = rel.join(&name);
            let child = root.join(&rel_child);
            let meta = fs::metadata(&child).await?;
            if meta.is_file() {
                out.push((rel_child, meta.len()));
            } else if meta.is_dir() {
                scan_tree(root, rel_child, out).await?;
            } else {
                return Err(StorageError::InvalidExistingFile {
                    path: child.to_string_lossy().into_owned(),
                    reason: "not a directory or regular file".into(),
                });
            }
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_counting_respects_boundaries() {
        // file ending exactly on a boundary keeps the boundary piece out
        assert_eq!(count_pieces(0, 30, 10), 3);
        assert_eq!(count_pieces(0, 31, 10), 4);
        assert_eq!(count_pieces(5, 10, 10), 2);
        assert_eq!(count_pieces(10, 10, 10), 1);
        assert_eq!(count_pieces(0, 0, 10), 0);
        // tiny file strictly inside one piece
        assert_eq!(count_pieces(12, 3, 10), 1);
    }
}
