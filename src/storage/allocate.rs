//! Growing real files to their target sizes ahead of download.

use std::io::SeekFrom;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::chain::NodeId;
use super::engine::ContentEngine;
use super::error::StorageError;
use super::handles::OpenMode;
use crate::bitfield::Bitfield;
use crate::constants::OPT_IO_SIZE;

/// File preallocation policy.
///
/// `Full` writes real zeros and costs the disk space up front; `Sparse`
/// extends via truncation where the filesystem supports it; `None` relies
/// entirely on staging and merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    #[default]
    None,
    Sparse,
    Full,
}

impl ContentEngine {
    /// Extends every incomplete real file toward its target size, in
    /// chain order. Files entirely outside the download filter are
    /// skipped.
    pub(crate) async fn extend_all(&mut self) -> Result<(), StorageError> {
        for index in 0..self.files.len() {
            let id = self.files[index];
            let node = self.chain.node(id);
            if node.size > 0 && node.size >= node.length() {
                continue;
            }
            if let Some(unwanted) = &self.download_filter {
                // skip the file unless every piece of it is wanted
                let mut pieces = Bitfield::new(self.npieces);
                self.set_filter(index, &mut pieces, self.piece_length);
                pieces.invert();
                pieces.intersect(unwanted);
                if !pieces.is_empty() {
                    continue;
                }
            }
            self.extend_file(id).await?;
        }
        Ok(())
    }

    /// Grows one real file. The target is the gap to the next chain node,
    /// not the declared length, so staged data is never overwritten.
    async fn extend_file(&mut self, id: NodeId) -> Result<(), StorageError> {
        let (target, length, size) = {
            let node = self.chain.node(id);
            let target = match node.next {
                Some(next) => self.chain.node(next).offset - node.offset,
                None => node.length(),
            };
            (target, node.length(), node.size)
        };

        if let Err(e) = self.open_plain(id, OpenMode::ReadWrite).await {
            warn!(
                "failed to open file \"{}\" for writing: {}",
                self.node_path(id).display(),
                e
            );
            // creating a zero-length file is all a zero-length file needs
            return if length == 0 { Ok(()) } else { Err(e) };
        }
        if length == 0 {
            self.close_node(id).await;
            return Ok(());
        }

        debug!(
            "allocating \"{}\" to {} bytes",
            self.node_path(id).display(),
            target
        );
        let path = self.node_path(id);
        let result = match self.allocate {
            AllocationMode::Full => self.fill_zeros(id, size, target - size).await,
            _ => self.truncate_to(id, target).await,
        };
        if let Err(e) = result {
            warn!("allocate file \"{}\" failed: {}", path.display(), e);
            self.close_node(id).await;
            return Err(StorageError::WriteFailed {
                path: path.display().to_string(),
                source: e,
            });
        }

        self.chain.node_mut(id).size = target;
        self.close_node(id).await;
        Ok(())
    }

    /// Appends `count` zero bytes starting at `from`, in `OPT_IO_SIZE`
    /// blocks.
    async fn fill_zeros(&mut self, id: NodeId, from: u64, count: u64) -> std::io::Result<()> {
        let handle = self
            .cache
            .get_mut(id)
            .ok_or_else(|| std::io::Error::other("file handle disappeared from the open cache"))?;
        handle.file.seek(SeekFrom::Start(from)).await?;
        let zeros = vec![0u8; OPT_IO_SIZE];
        let mut left = count;
        let mut blocks = 0u64;
        while left > 0 {
            let nio = left.min(OPT_IO_SIZE as u64) as usize;
            handle.file.write_all(&zeros[..nio]).await?;
            left -= nio as u64;
            blocks += 1;
            if blocks % 100 == 0 {
                debug!("allocation progress: {} bytes left", left);
            }
        }
        handle.file.flush().await
    }

    /// Extends via truncation; filesystems that cannot (FAT) get a single
    /// byte written at `target - 1` instead.
    async fn truncate_to(&mut self, id: NodeId, target: u64) -> std::io::Result<()> {
        if target == 0 {
            return Ok(());
        }
        let handle = self
            .cache
            .get_mut(id)
            .ok_or_else(|| std::io::Error::other("file handle disappeared from the open cache"))?;
        match handle.file.set_len(target).await {
            Ok(()) => Ok(()),
            Err(_) => {
                handle.file.seek(SeekFrom::Start(target - 1)).await?;
                handle.file.write_all(&[0]).await?;
                handle.file.flush().await
            }
        }
    }
}
