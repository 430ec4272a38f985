//! Splicing staged bytes back into real files.
//!
//! A real file whose written prefix has reached the start of the staging
//! file that follows it in the chain is mergeable: the staged bytes are
//! appended to the real file at `OPT_IO_SIZE` granularity, the staging
//! artifact is deleted, and its subdirectory is removed once empty. Merges
//! pause for [`WRITE_RETRY_INTERVAL`](crate::constants::WRITE_RETRY_INTERVAL)
//! after a disk write error so a full disk is not hammered.

use std::io::SeekFrom;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::chain::NodeId;
use super::engine::ContentEngine;
use super::error::StorageError;
use super::handles::OpenMode;
use super::io::read_upto;
use crate::constants::{OPT_IO_SIZE, WRITE_RETRY_INTERVAL};

/// How far a merge pass goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Stop after the first successful merge.
    One,
    /// Exhaust every mergeable pair in one pass.
    All,
}

impl ContentEngine {
    /// Whether a merge pass is wanted now. Suppressed during the
    /// write-failure backoff window.
    pub fn need_merge(&self) -> bool {
        if !self.needs_merge {
            return false;
        }
        if self.write_failed {
            if let Some(tried) = self.write_tried {
                if self.clock.now() < tried + WRITE_RETRY_INTERVAL {
                    return false;
                }
            }
        }
        true
    }

    /// Scans the chain and merges mergeable pairs. Returns whether
    /// anything was merged. A complete scan clears the merge flag; a scan
    /// cut short by `MergeMode::One` or an error leaves it set.
    pub async fn find_and_merge(&mut self, mode: MergeMode) -> Result<bool, StorageError> {
        let mut merged = false;
        let mut cur = self.chain.head();
        while let Some(id) = cur {
            while self.mergeable(id) {
                debug!("merge pass: file at offset {}", self.chain.node(id).offset);
                self.merge_staging(id).await?;
                merged = true;
                if mode == MergeMode::One {
                    return Ok(true);
                }
            }
            cur = self.chain.node(id).next_real;
        }
        self.needs_merge = false;
        Ok(merged)
    }

    /// One merge anywhere in the chain, ignoring the backoff window. Used
    /// opportunistically when the disk reports no space, since deleting a
    /// staging file may free enough to continue.
    pub(crate) async fn merge_any(&mut self) -> bool {
        match self.find_and_merge(MergeMode::One).await {
            Ok(merged) => merged,
            Err(e) => {
                warn!("opportunistic merge failed: {}", e);
                false
            }
        }
    }

    fn mergeable(&self, id: NodeId) -> bool {
        let node = self.chain.node(id);
        if node.is_staging() || node.size >= node.length() {
            return false;
        }
        let Some(next) = node.next else {
            return false;
        };
        let nxt = self.chain.node(next);
        nxt.is_staging() && node.data_end() >= nxt.offset
    }

    /// Merges the staging file directly after `dst` into `dst`, then
    /// deletes the staging artifact and unlinks it from the chain.
    async fn merge_staging(&mut self, dst: NodeId) -> Result<(), StorageError> {
        let Some(src) = self.chain.node(dst).next else {
            return Ok(());
        };
        let (src_offset, src_size) = {
            let node = self.chain.node(src);
            (node.offset, node.size)
        };
        let src_name = match &self.chain.node(src).kind {
            super::chain::NodeKind::Staging(s) => s.name.clone(),
            super::chain::NodeKind::Real(_) => return Ok(()),
        };
        let dst_path = self.node_path(dst);
        let src_path = self.node_path(src);

        if src_offset + src_size <= self.chain.node(dst).data_end() {
            debug!(
                "staging file {} range already present in \"{}\"",
                src_name,
                dst_path.display()
            );
        } else {
            debug!("merge file {} to \"{}\"", src_name, dst_path.display());
            self.copy_staged(dst, src, &dst_path, &src_path).await?;
            let node = self.chain.node(dst);
            if node.size == node.length() {
                // complete; reopens read-only on next use
                self.close_node(dst).await;
            }
        }

        // Delete the artifact whether its bytes were copied or already
        // covered.
        self.close_node(src).await;
        debug!("delete file \"{}\"", src_path.display());
        if let Err(e) = fs::remove_file(&src_path).await {
            warn!("error deleting file \"{}\": {}", src_path.display(), e);
        }
        self.chain.unlink_after(dst, src);

        // Subdirectory bookkeeping: an empty staging subdirectory goes
        // away; draining the active one also clears it.
        let mut check_dir = true;
        if self.stagecount > 0
            && self
                .stagedir
                .as_deref()
                .is_some_and(|dir| src_name.starts_with(dir))
        {
            self.stagecount -= 1;
            check_dir = self.stagecount == 0;
            if check_dir {
                self.stagedir = None;
            }
        }
        if check_dir {
            let subdir = &src_name[..self.offset_width.min(src_name.len())];
            let dir = self.staging_root.join(subdir);
            if let Ok(mut entries) = fs::read_dir(&dir).await {
                if let Ok(None) = entries.next_entry().await {
                    debug!("remove dir \"{}\"", dir.display());
                    if let Err(e) = fs::remove_dir(&dir).await {
                        warn!("remove directory \"{}\" failed: {}", dir.display(), e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Copies the uncovered tail of `src` onto the end of `dst` at
    /// `OPT_IO_SIZE` granularity, flushing after every block.
    async fn copy_staged(
        &mut self,
        dst: NodeId,
        src: NodeId,
        dst_path: &std::path::Path,
        src_path: &std::path::Path,
    ) -> Result<(), StorageError> {
        let (dst_size, dst_length) = {
            let node = self.chain.node(dst);
            (node.size, node.length())
        };
        let (src_offset, src_size) = {
            let node = self.chain.node(src);
            (node.offset, node.size)
        };

        self.open_plain(src, OpenMode::ReadOnly).await?;
        // position in src where dst's data ends
        let src_pos = self.chain.node(dst).offset + dst_size - src_offset;
        let mut remain = src_size - src_pos;
        {
            let handle = self
                .cache
                .get_mut(src)
                .ok_or(StorageError::OutOfHandles)?;
            handle
                .file
                .seek(SeekFrom::Start(src_pos))
                .await
                .map_err(|e| StorageError::ReadFailed {
                    path: src_path.display().to_string(),
                    source: e,
                })?;
        }

        // Guard src from eviction while dst is opened.
        self.cache
            .touch(src, self.clock.now() + Duration::from_secs(1));
        self.open_plain(dst, OpenMode::ReadWrite).await?;
        {
            let handle = self
                .cache
                .get_mut(dst)
                .ok_or(StorageError::OutOfHandles)?;
            handle
                .file
                .seek(SeekFrom::Start(dst_size))
                .await
                .map_err(|e| StorageError::WriteFailed {
                    path: dst_path.display().to_string(),
                    source: e,
                })?;
        }

        let mut buf = vec![0u8; OPT_IO_SIZE];
        let mut written = dst_size;
        while remain > 0 && written < dst_length {
            let nio = remain.min(OPT_IO_SIZE as u64) as usize;
            let got = {
                let handle = self
                    .cache
                    .get_mut(src)
                    .ok_or(StorageError::OutOfHandles)?;
                read_upto(&mut handle.file, &mut buf[..nio]).await.map_err(|e| {
                    StorageError::ReadFailed {
                        path: src_path.display().to_string(),
                        source: e,
                    }
                })?
            };
            if got == 0 {
                // the artifact is shorter than its recorded size; abort
                // and keep it rather than absorb a truncated copy
                return Err(StorageError::ReadFailed {
                    path: src_path.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "staging file truncated",
                    ),
                });
            }
            let write_result: Result<(), std::io::Error> = async {
                let handle = self.cache.get_mut(dst).ok_or_else(|| {
                    std::io::Error::other("file handle disappeared from the open cache")
                })?;
                handle.file.write_all(&buf[..got]).await?;
                handle.file.flush().await?;
                Ok(())
            }
            .await;
            if let Err(e) = write_result {
                warn!(
                    "write or flush failed at {} on \"{}\": {}",
                    written,
                    dst_path.display(),
                    e
                );
                warn!(
                    "error merging data; more disk space may be needed, retrying in {} seconds",
                    WRITE_RETRY_INTERVAL.as_secs()
                );
                self.write_failed = true;
                self.write_tried = Some(self.clock.now());
                return Err(StorageError::WriteFailed {
                    path: dst_path.display().to_string(),
                    source: e,
                });
            }
            self.write_failed = false;
            remain -= got as u64;
            written += got as u64;
            let node = self.chain.node_mut(dst);
            if written > node.size {
                node.size = written;
            }
        }
        Ok(())
    }
}
