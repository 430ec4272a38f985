//! Read/write dispatch across the file chain.
//!
//! A transfer walks the chain in ascending offset order, clipping each
//! step to the current node. Writes that land past all existing material
//! create staging files on demand; reads of uncovered bytes are an error.

use std::io::SeekFrom;

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::chain::{Node, NodeId};
use super::engine::ContentEngine;
use super::error::StorageError;
use super::handles::OpenMode;
use crate::constants::{MAX_IO_SPAN, MAX_STAGEDIR_FILES, MAX_STAGEFILE_SIZE};

enum IoOp<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl IoOp<'_> {
    fn len(&self) -> usize {
        match self {
            IoOp::Read(buf) => buf.len(),
            IoOp::Write(buf) => buf.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, IoOp::Write(_))
    }
}

impl ContentEngine {
    /// Reads `buf.len()` bytes starting at absolute offset `offset`.
    ///
    /// Bytes inside a file's materialized size but never written read back
    /// as zeros (holes). Reading a byte no file covers is [`StorageError::GapRead`].
    pub async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_range(offset, buf.len())?;
        let span = split_width(buf.len());
        let mut done = 0;
        while done < buf.len() {
            let step = span.min(buf.len() - done);
            self.io_span(offset + done as u64, IoOp::Read(&mut buf[done..done + step]))
                .await?;
            done += step;
        }
        Ok(())
    }

    /// Writes `buf` starting at absolute offset `offset`, staging any part
    /// that lands beyond existing file material.
    pub async fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        self.check_range(offset, buf.len())?;
        let span = split_width(buf.len());
        let mut done = 0;
        while done < buf.len() {
            let step = span.min(buf.len() - done);
            self.io_span(offset + done as u64, IoOp::Write(&buf[done..done + step]))
                .await?;
            done += step;
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), StorageError> {
        let in_range = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.total_length);
        if !in_range {
            warn!("data offset {} length {} out of range", offset, len);
            return Err(StorageError::OutOfRange {
                offset,
                length: len as u64,
            });
        }
        Ok(())
    }

    /// One chain walk over a span that fits in a single syscall.
    async fn io_span(&mut self, start: u64, mut op: IoOp<'_>) -> Result<(), StorageError> {
        let write = op.is_write();
        let total = op.len();
        let mut off = start;
        let mut cursor = 0usize;

        // Find the first node. A write may also append directly at a
        // node's data end, unless that node is a staging file at the cap.
        let mut cur = self.chain.head();
        let mut pred: Option<NodeId> = None;
        while let Some(id) = cur {
            let node = self.chain.node(id);
            let appendable = write
                && off == node.data_end()
                && (!node.is_staging() || node.size < MAX_STAGEFILE_SIZE);
            if off >= node.offset && (off < node.data_end() || appendable) {
                break;
            }
            if off < node.offset {
                cur = None;
                break;
            }
            pred = Some(id);
            cur = if !node.is_staging() && off >= node.offset + node.length() {
                node.next_real
            } else {
                node.next
            };
        }

        while cursor < total {
            // A staging file at the soft cap takes no more appends; roll
            // over to a fresh one.
            if write {
                if let Some(id) = cur {
                    let node = self.chain.node(id);
                    if node.is_staging()
                        && node.size >= MAX_STAGEFILE_SIZE
                        && off == node.data_end()
                    {
                        pred = Some(id);
                        cur = None;
                    }
                }
            }

            let id = match cur {
                Some(id) => id,
                None if write => {
                    let pred_id = match pred.filter(|&p| self.chain.exists(p)) {
                        Some(p) => p,
                        None => self
                            .chain
                            .insertion_point(off)
                            .ok_or(StorageError::GapRead(off))?,
                    };
                    self.create_staging(off, pred_id).await?
                }
                None => {
                    warn!("failed to find file for offset {}", off);
                    return Err(StorageError::GapRead(off));
                }
            };
            cur = Some(id);

            let mode = if write {
                OpenMode::ReadWrite
            } else {
                OpenMode::ReadOnly
            };
            self.open_for_io(id, mode).await?;

            let node = self.chain.node(id);
            let pos = off - node.offset;
            let remaining = (total - cursor) as u64;
            let nio = if !write {
                remaining.min(node.size - pos)
            } else {
                match &node.kind {
                    super::chain::NodeKind::Real(r) => remaining.min(r.length - pos),
                    super::chain::NodeKind::Staging(_) => match node.next {
                        Some(next) => {
                            remaining.min(self.chain.node(next).offset - node.offset - pos)
                        }
                        None => remaining,
                    },
                }
            } as usize;

            if nio > 0 {
                let path = self.node_path(id);
                match &mut op {
                    IoOp::Read(buf) => {
                        let result: Result<(), std::io::Error> = async {
                            let handle =
                                self.cache.get_mut(id).ok_or_else(stale_handle)?;
                            handle.file.seek(SeekFrom::Start(pos)).await?;
                            // a short read with no error is end of file
                            read_upto(&mut handle.file, &mut buf[cursor..cursor + nio]).await?;
                            Ok(())
                        }
                        .await;
                        if let Err(e) = result {
                            warn!(
                                "read failed at {} on \"{}\": {}",
                                pos,
                                path.display(),
                                e
                            );
                            return Err(StorageError::ReadFailed {
                                path: path.display().to_string(),
                                source: e,
                            });
                        }
                    }
                    IoOp::Write(buf) => {
                        let result: Result<(), std::io::Error> = async {
                            let handle =
                                self.cache.get_mut(id).ok_or_else(stale_handle)?;
                            handle.file.seek(SeekFrom::Start(pos)).await?;
                            handle.file.write_all(&buf[cursor..cursor + nio]).await?;
                            handle.file.flush().await?;
                            Ok(())
                        }
                        .await;
                        if let Err(e) = result {
                            warn!(
                                "write or flush failed at {} on \"{}\": {}",
                                pos,
                                path.display(),
                                e
                            );
                            self.write_failed = true;
                            self.write_tried = Some(self.clock.now());
                            return Err(StorageError::WriteFailed {
                                path: path.display().to_string(),
                                source: e,
                            });
                        }
                        self.write_failed = false;

                        let node = self.chain.node_mut(id);
                        if pos + nio as u64 > node.size {
                            node.size = pos + nio as u64;
                        }
                    }
                }
            }

            if write {
                // a real file whose prefix caught up to staged data wants
                // a merge
                let node = self.chain.node(id);
                if !node.is_staging() && node.size < node.length() {
                    if let Some(next) = node.next {
                        let nxt = self.chain.node(next);
                        if nxt.is_staging() && node.data_end() >= nxt.offset {
                            self.needs_merge = true;
                        }
                    }
                }
                if self.chain.node(id).size == 0 {
                    self.close_node(id).await;
                }
            }

            cursor += nio;
            if cursor < total {
                off += nio as u64;
                pred = Some(id);
                match self.chain.node(id).next {
                    Some(next) if off < self.chain.node(next).offset => cur = None,
                    next => cur = next,
                }
            }
        }
        Ok(())
    }

    /// Allocates a new staging file at `off` and splices it in after
    /// `pred`, rolling the staging subdirectory when the current one is
    /// full.
    async fn create_staging(&mut self, off: u64, pred: NodeId) -> Result<NodeId, StorageError> {
        let subdir = self.active_stagedir(off).await?;
        let name = format!(
            "{}/{}-{:0width$}",
            subdir,
            self.torrent_id,
            off,
            width = self.offset_width
        );
        let id = self.chain.push(Node::staging(name, off, 0));
        self.chain.insert_after(pred, id);
        self.stagecount += 1;
        Ok(id)
    }

    /// The staging subdirectory to allocate into, creating a new one named
    /// after `off` when none is active or the active one is full.
    async fn active_stagedir(&mut self, off: u64) -> Result<String, StorageError> {
        if self.stagecount < MAX_STAGEDIR_FILES {
            if let Some(dir) = &self.stagedir {
                return Ok(dir.clone());
            }
        }
        let name = format!("{:0width$}", off, width = self.offset_width);
        let dir = self.staging_root.join(&name);
        debug!("create dir \"{}\"", dir.display());
        match fs::create_dir_all(&dir).await {
            Ok(()) => {
                self.stagedir = Some(name.clone());
                self.stagecount = 0;
                Ok(name)
            }
            Err(e) => match &self.stagedir {
                // keep filling the previous subdirectory rather than fail
                // the write outright
                Some(old) => {
                    warn!("create directory \"{}\" failed: {}", dir.display(), e);
                    Ok(old.clone())
                }
                None => {
                    warn!("create directory \"{}\" failed: {}", dir.display(), e);
                    Err(e.into())
                }
            },
        }
    }
}

fn stale_handle() -> std::io::Error {
    std::io::Error::other("file handle disappeared from the open cache")
}

/// Fills `buf` until full or end of file; a short read is not an error.
pub(crate) async fn read_upto(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read(&mut buf[done..]).await?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

/// Halves `len` until it fits in one syscall.
fn split_width(len: usize) -> usize {
    let mut span = len as u64;
    while span > MAX_IO_SPAN {
        span /= 2;
    }
    span as usize
}
