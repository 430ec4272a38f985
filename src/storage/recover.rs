//! Startup: rediscover staging artifacts, stat existing content, allocate,
//! and work out which pieces are already whole on disk.

use std::io;

use tokio::fs;
use tracing::{debug, warn};

use super::allocate::AllocationMode;
use super::chain::Node;
use super::engine::ContentEngine;
use super::error::StorageError;
use super::merge::MergeMode;
use crate::bitfield::Bitfield;

impl ContentEngine {
    /// Walks the staging tree for artifacts left by an earlier run and
    /// splices them into the chain, then stats the real files. Returns
    /// whether any byte of content was found on disk.
    ///
    /// Staging subdirectories are recognized by name width; artifacts by
    /// the `<torrent_id>-<offset>` pattern, with the offset parsed out of
    /// the name.
    pub async fn setup(&mut self) -> Result<bool, StorageError> {
        let mut found_bytes = false;

        match fs::read_dir(&self.staging_root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    "cannot access staging directory \"{}\": {}",
                    self.staging_root.display(),
                    e
                );
                return Err(e.into());
            }
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let Some(subdir) = entry.file_name().to_str().map(str::to_owned) else {
                        continue;
                    };
                    if subdir.len() != self.offset_width {
                        continue;
                    }
                    let sub_path = self.staging_root.join(&subdir);
                    let Ok(meta) = fs::metadata(&sub_path).await else {
                        continue;
                    };
                    if !meta.is_dir() {
                        continue;
                    }
                    let Ok(mut files) = fs::read_dir(&sub_path).await else {
                        continue;
                    };
                    self.stagedir = Some(subdir.clone());
                    self.stagecount = 0;
                    while let Some(file) = files.next_entry().await? {
                        let Some(name) = file.file_name().to_str().map(str::to_owned) else {
                            continue;
                        };
                        if self.recover_staging_file(&subdir, &name).await? {
                            found_bytes = true;
                        }
                    }
                }
            }
        }

        // Check the main content files.
        for id in self.files.clone() {
            let path = self.node_path(id);
            match fs::metadata(&path).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("stat file \"{}\" failed: {}", path.display(), e);
                    return Err(e.into());
                }
                Ok(meta) => {
                    if !meta.is_file() {
                        return Err(StorageError::InvalidExistingFile {
                            path: path.display().to_string(),
                            reason: "not a regular file".into(),
                        });
                    }
                    let length = self.chain.node(id).length();
                    if meta.len() > length {
                        return Err(StorageError::InvalidExistingFile {
                            path: path.display().to_string(),
                            reason: format!("size is too big; should be {length}"),
                        });
                    }
                    self.chain.node_mut(id).size = meta.len();
                    if meta.len() > 0 {
                        found_bytes = true;
                    }
                }
            }
        }

        Ok(found_bytes)
    }

    /// Inspects one staging-directory entry; splices it into the chain
    /// when it belongs to this torrent. Returns whether it holds bytes.
    async fn recover_staging_file(
        &mut self,
        subdir: &str,
        name: &str,
    ) -> Result<bool, StorageError> {
        let Some(rest) = name.strip_prefix(&self.torrent_id) else {
            return Ok(false);
        };
        let Some(digits) = rest.strip_prefix('-') else {
            return Ok(false);
        };
        if digits.len() != self.offset_width {
            return Err(StorageError::InvalidExistingFile {
                path: format!("{subdir}/{name}"),
                reason: "unparseable staging offset".into(),
            });
        }
        let offset: u64 = digits.parse().map_err(|_| StorageError::InvalidExistingFile {
            path: format!("{subdir}/{name}"),
            reason: "unparseable staging offset".into(),
        })?;

        let path = self.staging_root.join(subdir).join(name);
        let Ok(meta) = fs::metadata(&path).await else {
            return Ok(false);
        };
        if !meta.is_file() {
            return Ok(false);
        }

        debug!("found staging file {}/{} size {}", subdir, name, meta.len());
        let node = Node::staging(format!("{subdir}/{name}"), offset, meta.len());
        let id = self.chain.push(node);
        let pred = self
            .chain
            .insertion_point(offset)
            .ok_or(StorageError::GapRead(offset))?;
        self.chain.insert_after(pred, id);
        self.stagecount += 1;
        Ok(meta.len() > 0)
    }

    /// Creates and allocates the content files per the allocation policy,
    /// merging staged data in between so allocation never overwrites it.
    /// Returns the bitfield of pieces already fully present on disk.
    pub async fn create_files(&mut self) -> Result<Bitfield, StorageError> {
        // staging will be used; make sure its tree exists
        if self.allocate == AllocationMode::None || self.download_filter.is_some() {
            fs::create_dir_all(&self.staging_root).await?;
        }

        if self.allocate == AllocationMode::None {
            self.needs_merge = true;
        } else {
            debug!("allocating files");
            if let Err(e) = self.find_and_merge(MergeMode::All).await {
                warn!("merge during allocation failed: {}", e);
            }
            loop {
                if let Err(e) = self.extend_all().await {
                    warn!("file allocation failed: {}", e);
                    break;
                }
                match self.find_and_merge(MergeMode::All).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!("merge during allocation failed: {}", e);
                        break;
                    }
                }
            }
        }

        let present = self.present_pieces();
        debug!("files contain {} pieces", present.count());
        Ok(present)
    }

    /// Which pieces are completely backed by bytes on disk, counting
    /// staged bytes when they join real data without a gap.
    pub(crate) fn present_pieces(&self) -> Bitfield {
        let mut pieces = Bitfield::new(self.npieces);
        let piece_length = self.piece_length;
        let mut cur = self.chain.head();

        'pieces: for index in 0..self.npieces {
            let Some(mut id) = cur else { break };
            let piece_start = index as u64 * piece_length;
            if piece_start < self.chain.node(id).offset {
                continue; // gap before the current node; keep scanning
            }

            // Skip empty nodes and data that ends before this piece.
            let mut node = self.chain.node(id);
            while node.size == 0 || (piece_start >= node.data_end() && node.next.is_some()) {
                match node.next {
                    Some(next) => {
                        id = next;
                        node = self.chain.node(next);
                    }
                    None => break 'pieces,
                }
            }
            if piece_start >= node.data_end() {
                break; // the last data on disk ends before this piece
            }

            if piece_start >= node.offset {
                let len = if index == self.npieces - 1 {
                    self.total_length - piece_start
                } else {
                    piece_length
                };
                let piece_end = piece_start + len;
                let mut data_end = node.data_end();
                // follow seamless joins across nodes
                while piece_end > data_end {
                    let Some(next) = node.next else { break };
                    if self.chain.node(next).offset > data_end {
                        break;
                    }
                    id = next;
                    node = self.chain.node(next);
                    data_end = node.data_end();
                }
                if piece_end <= data_end {
                    pieces.set(index);
                }
            }
            cur = Some(id);
        }
        pieces
    }
}
