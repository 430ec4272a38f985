//! Bounded cache of open file handles.
//!
//! Arbitrarily many chain nodes are served through a fixed open-descriptor
//! budget. A node already open in a usable mode is reused (read-write
//! satisfies everything, read-only satisfies reads); a read-only handle
//! asked to serve a write is closed and reopened read-write. The cache
//! only holds the handles; the engine enforces the budget and picks
//! eviction victims in chain order, where it can see the chain.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Instant;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::chain::NodeId;
use super::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
pub(crate) struct OpenHandle {
    pub(crate) file: File,
    pub(crate) read_only: bool,
    pub(crate) last_used: Instant,
}

/// Open handles keyed by chain node.
#[derive(Debug)]
pub(crate) struct OpenCache {
    handles: BTreeMap<NodeId, OpenHandle>,
    limit: usize,
}

impl OpenCache {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            handles: BTreeMap::new(),
            limit,
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn at_budget(&self) -> bool {
        self.handles.len() >= self.limit
    }

    pub(crate) fn is_open(&self, id: NodeId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Whether `id` is already open in a mode that can serve `mode`.
    pub(crate) fn usable(&self, id: NodeId, mode: OpenMode) -> bool {
        self.handles
            .get(&id)
            .is_some_and(|h| !h.read_only || mode == OpenMode::ReadOnly)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut OpenHandle> {
        self.handles.get_mut(&id)
    }

    pub(crate) fn last_used(&self, id: NodeId) -> Option<Instant> {
        self.handles.get(&id).map(|h| h.last_used)
    }

    /// Refreshes a node's eviction timestamp, e.g. to guard it while a
    /// second handle is opened.
    pub(crate) fn touch(&mut self, id: NodeId, at: Instant) {
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.last_used = at;
        }
    }

    /// Opens `id` in `mode` and adds the handle. The caller has already
    /// made room under the budget.
    pub(crate) async fn open(
        &mut self,
        id: NodeId,
        path: &Path,
        mode: OpenMode,
        now: Instant,
    ) -> Result<(), StorageError> {
        debug!(
            "open {} file \"{}\"",
            match mode {
                OpenMode::ReadOnly => "ro",
                OpenMode::ReadWrite => "rw",
            },
            path.display()
        );
        let file = open_file(path, mode).await?;
        self.handles.insert(
            id,
            OpenHandle {
                file,
                read_only: mode == OpenMode::ReadOnly,
                last_used: now,
            },
        );
        Ok(())
    }

    /// Flushes and drops a handle. Close errors are logged, not
    /// propagated.
    pub(crate) async fn close(&mut self, id: NodeId, path: &Path) {
        if let Some(mut handle) = self.handles.remove(&id) {
            debug!("close file \"{}\"", path.display());
            if !handle.read_only {
                if let Err(e) = handle.file.flush().await {
                    warn!("error closing file \"{}\": {}", path.display(), e);
                }
            }
        }
    }

    /// Closes every handle, e.g. at engine shutdown.
    pub(crate) async fn close_all(&mut self) {
        while let Some((_, mut handle)) = self.handles.pop_first() {
            if !handle.read_only {
                if let Err(e) = handle.file.flush().await {
                    warn!("error closing file: {}", e);
                }
            }
        }
    }
}

async fn open_file(path: &Path, mode: OpenMode) -> io::Result<File> {
    match mode {
        OpenMode::ReadOnly => File::open(path).await,
        OpenMode::ReadWrite => {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .await
        }
    }
}
