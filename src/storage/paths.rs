//! Path sanitizing and filename conversion for torrent-declared names.

use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::warn;

use super::error::StorageError;
use crate::constants::MAX_PATH_LEN;

/// Rewrites every non-printable byte of `src` as its uppercase two-hex-digit
/// form. A `_` separates a printable run from a hex run in either direction,
/// except next to punctuation (and never between two hex runs). Returns the
/// rewritten name and whether anything was rewritten.
///
/// Printable ASCII input comes back unchanged, and the function is
/// idempotent on its own output.
pub fn convert_filename(src: &[u8]) -> (String, bool) {
    let mut out = String::with_capacity(src.len());
    let mut converted = false;
    let mut prev_print = false;
    let mut prev_punct = false;

    for &b in src {
        if (0x20..=0x7E).contains(&b) {
            let punct = b.is_ascii_punctuation();
            if !out.is_empty() && !prev_print && !punct {
                out.push('_');
            }
            out.push(b as char);
            prev_print = true;
            prev_punct = punct;
        } else {
            if prev_print && !prev_punct {
                out.push('_');
            }
            let _ = write!(out, "{b:02X}");
            prev_print = false;
            prev_punct = false;
            converted = true;
        }
    }
    (out, converted)
}

/// Checks one path component from an `info|files|path` list: no separators,
/// no `..`, no NUL, not empty.
pub(crate) fn check_component(comp: &[u8]) -> Result<(), StorageError> {
    if comp.is_empty()
        || comp == b".."
        || comp.contains(&b'/')
        || comp.contains(&b'\\')
        || comp.contains(&0)
    {
        return Err(StorageError::InvalidPath(
            String::from_utf8_lossy(comp).into_owned(),
        ));
    }
    Ok(())
}

/// Checks an assembled relative path: must not be empty, absolute, or reach
/// outside its root through `..`.
pub(crate) fn check_relative(raw: &[u8]) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidPath(String::from_utf8_lossy(raw).into_owned());
    if raw.is_empty() || raw[0] == b'/' || raw.starts_with(b"..") || raw.contains(&0) {
        return Err(invalid());
    }
    for comp in raw.split(|&b| b == b'/') {
        if comp.is_empty() || comp == b".." {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Validates `raw` and turns it into a relative [`PathBuf`], rewriting
/// non-printable bytes when `convert` is set. When a rewrite would be
/// needed but conversion is disabled, the original bytes are kept and a
/// warning is logged.
pub(crate) fn normalize(raw: &[u8], convert: bool) -> Result<PathBuf, StorageError> {
    check_relative(raw)?;
    let (rewritten, changed) = convert_filename(raw);
    let path = if changed && convert {
        PathBuf::from(rewritten)
    } else {
        if changed {
            warn!(
                "name \"{}\" contains non-printable characters; enable filename conversion to rewrite",
                rewritten
            );
        }
        bytes_to_path(raw)
    };
    if path.as_os_str().len() > MAX_PATH_LEN {
        return Err(StorageError::NameTooLong(
            path.to_string_lossy().into_owned(),
        ));
    }
    Ok(path)
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_ascii_is_identity() {
        for input in ["plain.bin", "dir-1/file_2.txt", "A (copy) [v2]"] {
            let (out, changed) = convert_filename(input.as_bytes());
            assert_eq!(out, input);
            assert!(!changed);
        }
    }

    #[test]
    fn non_printable_bytes_become_hex() {
        let (out, changed) = convert_filename(b"ab\x01cd");
        assert!(changed);
        assert_eq!(out, "ab_01_cd");

        let (out, changed) = convert_filename(b"\xFF\xFEname");
        assert!(changed);
        assert_eq!(out, "FFFE_name");
    }

    #[test]
    fn punctuation_suppresses_separator() {
        // '.' is punctuation: no '_' between it and the hex run
        let (out, _) = convert_filename(b"a.\x07b");
        assert_eq!(out, "a.07_b");
        let (out, _) = convert_filename(b"a\x07.b");
        assert_eq!(out, "a_07.b");
    }

    #[test]
    fn conversion_is_idempotent() {
        let inputs: &[&[u8]] = &[b"ab\x01cd", b"\x00\x01\x02", b"x\xC3\xA9y", b"norm.al"];
        for input in inputs {
            let (once, _) = convert_filename(input);
            let (twice, changed) = convert_filename(once.as_bytes());
            assert_eq!(once, twice);
            assert!(!changed);
        }
    }

    #[test]
    fn unsafe_paths_rejected() {
        assert!(check_relative(b"/abs/path").is_err());
        assert!(check_relative(b"../escape").is_err());
        assert!(check_relative(b"a/../b").is_err());
        assert!(check_relative(b"a//b").is_err());
        assert!(check_relative(b"").is_err());
        assert!(check_relative(b"ok/nested/file").is_ok());

        assert!(check_component(b"..").is_err());
        assert!(check_component(b"a/b").is_err());
        assert!(check_component(b"fine.txt").is_ok());
    }

    #[test]
    fn normalize_applies_conversion_when_enabled() {
        let path = normalize(b"dir/f\x01le", true).unwrap();
        assert_eq!(path, PathBuf::from("dir/f_01_le"));

        // disabled: original bytes survive
        let path = normalize(b"dir/file", false).unwrap();
        assert_eq!(path, PathBuf::from("dir/file"));
    }

    #[test]
    fn normalize_rejects_overlong() {
        let raw = vec![b'a'; MAX_PATH_LEN + 1];
        assert!(matches!(
            normalize(&raw, false),
            Err(StorageError::NameTooLong(_))
        ));
    }
}
