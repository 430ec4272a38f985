//! Engine constants and tuning parameters.
//!
//! These values match the long-standing defaults of classic staging-file
//! clients; the staging-related ones shape the on-disk staging layout, so
//! treat them as part of the format.

use std::time::Duration;

// ============================================================================
// Open-file budget
// ============================================================================

/// Maximum simultaneously open data files.
pub const MAX_OPEN_FILES: usize = 20;

// ============================================================================
// I/O sizing
// ============================================================================

/// Optimal transfer size for large operations (merge copies, full
/// preallocation): 256 KiB.
pub const OPT_IO_SIZE: usize = 262144;

/// Largest span issued as a single transfer. Matches the kernel cap on a
/// single read/write syscall; larger requests are split in halves.
pub const MAX_IO_SPAN: u64 = 0x7fff_f000;

// ============================================================================
// Staging layout
// ============================================================================

/// Soft size limit of one staging file (2 MiB). An append at the cap rolls
/// over to a new staging file.
pub const MAX_STAGEFILE_SIZE: u64 = 2097152;

/// Maximum staging files per staging subdirectory.
pub const MAX_STAGEDIR_FILES: usize = 200;

// ============================================================================
// Failure handling
// ============================================================================

/// How long merges and non-essential writes pause after a disk write error.
pub const WRITE_RETRY_INTERVAL: Duration = Duration::from_secs(300);

// ============================================================================
// Paths
// ============================================================================

/// Longest path the engine will assemble.
pub const MAX_PATH_LEN: usize = 4096;
