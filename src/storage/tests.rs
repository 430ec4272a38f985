use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::*;
use crate::bitfield::Bitfield;
use crate::clock::{Clock, ManualClock};
use crate::constants::{MAX_OPEN_FILES, MAX_STAGEDIR_FILES, MAX_STAGEFILE_SIZE};

fn single_file_meta(name: &str, length: u64) -> Vec<u8> {
    format!("d4:infod6:lengthi{length}e4:name{}:{name}ee", name.len()).into_bytes()
}

fn multi_file_meta(name: &str, files: &[(&str, u64)]) -> Vec<u8> {
    let mut out = String::from("d4:infod5:filesl");
    for (path, length) in files {
        out.push_str(&format!("d6:lengthi{length}e4:pathl"));
        for comp in path.split('/') {
            out.push_str(&format!("{}:{comp}", comp.len()));
        }
        out.push_str("ee");
    }
    out.push_str(&format!("e4:name{}:{name}ee", name.len()));
    out.into_bytes()
}

fn single_file_engine(tmp: &TempDir, length: u64, piece_length: u64) -> ContentEngine {
    let meta = single_file_meta("a.bin", length);
    let options =
        ContentOptions::new(tmp.path().join("staging")).save_as(tmp.path().join("a.bin"));
    ContentEngine::from_metainfo(&meta, "tid", piece_length, options)
        .expect("engine build")
}

fn list_dir(path: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn sequential_write_then_read() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 3, 2);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.write(0, b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    engine.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"abc");

    // no staging files were needed
    assert_eq!(list_dir(&tmp.path().join("staging").join("tid")), Vec::<String>::new());
}

#[tokio::test]
async fn out_of_order_write_stages_then_merges() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 10, 4);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();
    // without preallocation the engine asks for a merge pass up front;
    // the pass finds nothing and clears the flag
    assert!(!engine.find_and_merge(MergeMode::All).await.unwrap());
    assert!(!engine.need_merge());

    engine.write(5, b"WORLD").await.unwrap();
    // width of "10" is 2: subdirectory "05", artifact "tid-05"
    let staged = tmp.path().join("staging/tid/05/tid-05");
    assert_eq!(std::fs::read(&staged).unwrap(), b"WORLD");
    assert!(!engine.need_merge());

    engine.write(0, b"hello").await.unwrap();
    assert!(engine.need_merge());
    assert!(engine.find_and_merge(MergeMode::All).await.unwrap());

    assert_eq!(std::fs::read(tmp.path().join("a.bin")).unwrap(), b"helloWORLD");
    assert!(!staged.exists());
    // the drained subdirectory is gone too
    assert_eq!(list_dir(&tmp.path().join("staging").join("tid")), Vec::<String>::new());

    let mut buf = [0u8; 10];
    engine.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"helloWORLD");

    engine.close().await;
    assert!(!tmp.path().join("staging").join("tid").exists());
}

#[tokio::test]
async fn cross_file_write_splits_at_the_boundary() {
    let tmp = TempDir::new().unwrap();
    let meta = multi_file_meta("top", &[("x", 3), ("y", 4)]);
    let options = ContentOptions::new(tmp.path().join("staging"))
        .save_as(tmp.path().join("top"))
        .allocate(AllocationMode::Sparse);
    let mut engine = ContentEngine::from_metainfo(&meta, "tid", 4, options).unwrap();
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.write(1, b"BCDEF").await.unwrap();

    let mut buf = [0xAAu8; 7];
    engine.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"\0BCDEF\0");

    assert_eq!(std::fs::read(tmp.path().join("top/x")).unwrap(), b"\0BC");
    assert_eq!(std::fs::read(tmp.path().join("top/y")).unwrap(), b"DEF\0");
}

#[tokio::test]
async fn open_cache_evicts_at_the_budget() {
    let tmp = TempDir::new().unwrap();
    let files: Vec<(String, u64)> = (0..MAX_OPEN_FILES as u64 + 1)
        .map(|i| (format!("f{i:02}"), 1))
        .collect();
    let refs: Vec<(&str, u64)> = files.iter().map(|(n, l)| (n.as_str(), *l)).collect();
    let meta = multi_file_meta("top", &refs);
    let options = ContentOptions::new(tmp.path().join("staging")).save_as(tmp.path().join("top"));
    let mut engine = ContentEngine::from_metainfo(&meta, "tid", 4, options).unwrap();
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    for offset in 0..MAX_OPEN_FILES as u64 + 1 {
        engine.write(offset, b"x").await.unwrap();
    }
    assert_eq!(engine.open_files(), MAX_OPEN_FILES);
}

#[tokio::test]
async fn startup_recovery_rebuilds_the_chain() {
    let tmp = TempDir::new().unwrap();
    let subdir = tmp.path().join("staging/tid/05");
    std::fs::create_dir_all(&subdir).unwrap();
    std::fs::write(subdir.join("tid-05"), b"WORLD").unwrap();

    let mut engine = single_file_engine(&tmp, 10, 4);
    assert!(engine.setup().await.unwrap());
    engine.create_files().await.unwrap();

    engine.write(0, b"hello").await.unwrap();
    assert!(engine.need_merge());
    assert!(engine.find_and_merge(MergeMode::All).await.unwrap());
    assert_eq!(std::fs::read(tmp.path().join("a.bin")).unwrap(), b"helloWORLD");
}

#[tokio::test]
async fn recovery_rejects_unparseable_staging_offset() {
    let tmp = TempDir::new().unwrap();
    let subdir = tmp.path().join("staging/tid/05");
    std::fs::create_dir_all(&subdir).unwrap();
    std::fs::write(subdir.join("tid-xy"), b"junk").unwrap();

    let mut engine = single_file_engine(&tmp, 10, 4);
    assert!(matches!(
        engine.setup().await,
        Err(StorageError::InvalidExistingFile { .. })
    ));
}

#[tokio::test]
async fn recovery_rejects_oversized_content_file() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.bin"), vec![0u8; 11]).unwrap();

    let mut engine = single_file_engine(&tmp, 10, 4);
    assert!(matches!(
        engine.setup().await,
        Err(StorageError::InvalidExistingFile { .. })
    ));
}

#[tokio::test]
async fn choose_piece_prefers_gap_candidates() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 100, 10);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.write(0, &[0xAA; 30]).await.unwrap();
    engine.write(50, &[0xBB; 10]).await.unwrap();

    let mut choices = Bitfield::new(10);
    for i in [3, 4, 7] {
        choices.set(i);
    }
    let mut available = Bitfield::new(10);
    for i in 3..=7 {
        available.set(i);
    }

    // piece 3 does not bridge (gap is wider than a piece), so the pick is
    // random from the gap candidates {3, 4}
    for _ in 0..16 {
        let pick = engine.choose_piece(&choices, &available, 7);
        assert!(pick == 3 || pick == 4, "unexpected pick {pick}");
    }
}

#[tokio::test]
async fn choose_piece_returns_the_bridging_piece() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 100, 10);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.write(0, &[0xAA; 30]).await.unwrap();
    engine.write(40, &[0xBB; 10]).await.unwrap();

    let choices = Bitfield::new(10);
    let mut available = Bitfield::new(10);
    available.set(3);

    // piece 3 extends the file right into the staged data
    assert_eq!(engine.choose_piece(&choices, &available, 9), 3);
}

#[tokio::test]
async fn choose_piece_honors_preference_inside_the_gap() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 100, 10);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.write(0, &[0xAA; 30]).await.unwrap();
    engine.write(60, &[0xBB; 10]).await.unwrap();

    let mut choices = Bitfield::new(10);
    choices.set(4);
    let available = Bitfield::new(10);

    assert_eq!(engine.choose_piece(&choices, &available, 4), 4);
}

#[tokio::test]
async fn zero_length_io_at_the_end_is_fine() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 10, 4);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.write(10, &[]).await.unwrap();
    let mut empty = [0u8; 0];
    engine.read(10, &mut empty).await.unwrap();

    assert!(matches!(
        engine.write(10, b"x").await,
        Err(StorageError::OutOfRange { .. })
    ));
    let mut one = [0u8; 1];
    assert!(matches!(
        engine.read(10, &mut one).await,
        Err(StorageError::OutOfRange { .. })
    ));
}

#[tokio::test]
async fn reading_an_uncovered_byte_is_a_gap() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 10, 4);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    let mut buf = [0u8; 1];
    assert!(matches!(
        engine.read(5, &mut buf).await,
        Err(StorageError::GapRead(5))
    ));
}

#[tokio::test]
async fn staging_file_rolls_over_at_the_soft_cap() {
    let tmp = TempDir::new().unwrap();
    let total = 3 * MAX_STAGEFILE_SIZE;
    let mut engine = single_file_engine(&tmp, total, 262144);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    let start = 100;
    let block = vec![0x5A; MAX_STAGEFILE_SIZE as usize];
    engine.write(start, &block).await.unwrap();
    engine.write(start + MAX_STAGEFILE_SIZE, b"+").await.unwrap();

    let root = tmp.path().join("staging/tid");
    let subdirs = list_dir(&root);
    assert_eq!(subdirs.len(), 1);
    let files = list_dir(&root.join(&subdirs[0]));
    assert_eq!(files.len(), 2, "expected a second staging file: {files:?}");
}

#[tokio::test]
async fn full_staging_subdir_forces_a_new_one() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 1000, 64);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    // every write at an odd offset lands in a gap and creates an artifact
    for i in 0..MAX_STAGEDIR_FILES as u64 + 1 {
        engine.write(1 + 2 * i, b"z").await.unwrap();
    }

    let root = tmp.path().join("staging/tid");
    let subdirs = list_dir(&root);
    assert_eq!(subdirs.len(), 2, "expected rollover: {subdirs:?}");
    assert_eq!(list_dir(&root.join(&subdirs[0])).len(), MAX_STAGEDIR_FILES);
    assert_eq!(list_dir(&root.join(&subdirs[1])).len(), 1);
}

#[tokio::test]
async fn merge_backoff_suppresses_need_merge() {
    let tmp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Instant::now()));
    let mut engine = single_file_engine(&tmp, 10, 4).with_clock(clock.clone());
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    engine.needs_merge = true;
    engine.write_failed = true;
    engine.write_tried = Some(clock.now());
    assert!(!engine.need_merge());

    clock.advance(Duration::from_secs(301));
    assert!(engine.need_merge());
}

#[tokio::test]
async fn present_pieces_counts_seamless_staging_joins() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 40, 10);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    // [0, 15) in the real file, [15, 30) staged right at its edge
    engine.write(15, &[0xBB; 15]).await.unwrap();
    engine.write(0, &[0xAA; 15]).await.unwrap();

    let present = engine.present_pieces();
    assert!(present.is_set(0));
    assert!(present.is_set(1));
    assert!(present.is_set(2));
    assert!(!present.is_set(3));
}

#[tokio::test]
async fn set_filter_masks_everything_but_the_file() {
    let tmp = TempDir::new().unwrap();
    let meta = multi_file_meta("top", &[("a", 4), ("b", 2)]);
    let options = ContentOptions::new(tmp.path().join("staging")).save_as(tmp.path().join("top"));
    let engine = ContentEngine::from_metainfo(&meta, "tid", 2, options).unwrap();

    // file a covers pieces {0, 1}; it ends on a piece boundary, so piece 2
    // belongs to file b alone
    let mut filter = Bitfield::new(3);
    engine.set_filter(0, &mut filter, 2);
    assert!(!filter.is_set(0));
    assert!(!filter.is_set(1));
    assert!(filter.is_set(2));

    engine.set_filter(1, &mut filter, 2);
    assert!(filter.is_set(0));
    assert!(filter.is_set(1));
    assert!(!filter.is_set(2));

    // out of range clears the mask
    engine.set_filter(9, &mut filter, 2);
    assert!(filter.is_empty());

    assert_eq!(engine.file_pieces(0), 2);
    assert_eq!(engine.file_pieces(1), 1);
}

#[tokio::test]
async fn fill_meta_info_emits_canonical_layout_fields() {
    let tmp = TempDir::new().unwrap();
    let meta = multi_file_meta("top", &[("x", 3), ("sub/y", 4)]);
    let options = ContentOptions::new(tmp.path().join("staging"));
    let engine = ContentEngine::from_metainfo(&meta, "tid", 4, options).unwrap();

    let mut info = std::collections::BTreeMap::new();
    engine.fill_meta_info(&mut info).unwrap();
    let encoded = crate::bencode::encode(&crate::bencode::Value::Dict(info)).unwrap();
    assert_eq!(
        encoded,
        b"d5:filesld6:lengthi3e4:pathl1:xeed6:lengthi4e4:pathl3:sub1:yeee4:name3:tope"
    );

    // single-file layout gets length + name
    let meta = single_file_meta("a.bin", 7);
    let engine =
        ContentEngine::from_metainfo(&meta, "tid", 4, ContentOptions::new("staging")).unwrap();
    let mut info = std::collections::BTreeMap::new();
    engine.fill_meta_info(&mut info).unwrap();
    let encoded = crate::bencode::encode(&crate::bencode::Value::Dict(info)).unwrap();
    assert_eq!(encoded, b"d6:lengthi7e4:name5:a.bine");
}

#[tokio::test]
async fn from_directory_builds_a_seeding_layout() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    std::fs::create_dir_all(data.join("a")).unwrap();
    std::fs::write(data.join("a/a1.txt"), b"hello").unwrap();
    std::fs::write(data.join("b.txt"), b"world").unwrap();

    let options = ContentOptions::new(tmp.path().join("staging"));
    let mut engine = ContentEngine::from_directory(&data, "tid", 4, options)
        .await
        .unwrap();

    assert_eq!(engine.file_count(), 2);
    assert_eq!(engine.file_name(0), Some(PathBuf::from("a/a1.txt").as_path()));
    assert_eq!(engine.file_name(1), Some(PathBuf::from("b.txt").as_path()));
    assert_eq!(engine.total_length(), 10);
    assert_eq!(engine.file_size(0), 5);

    let mut buf = [0u8; 10];
    engine.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"helloworld");
}

#[tokio::test]
async fn write_read_round_trip_across_staging() {
    let tmp = TempDir::new().unwrap();
    let mut engine = single_file_engine(&tmp, 64, 16);
    engine.setup().await.unwrap();
    engine.create_files().await.unwrap();

    let payload: Vec<u8> = (0..32).map(|i| i as u8).collect();
    engine.write(20, &payload).await.unwrap();
    let mut buf = vec![0u8; 32];
    engine.read(20, &mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn summary_lists_files_and_completion() {
    let tmp = TempDir::new().unwrap();
    let meta = multi_file_meta("top", &[("a", 4), ("b", 2)]);
    let options = ContentOptions::new(tmp.path().join("staging")).save_as(tmp.path().join("top"));
    let engine = ContentEngine::from_metainfo(&meta, "tid", 2, options).unwrap();

    let plain = engine.summary(None);
    assert!(plain.contains("FILES INFO"));
    assert!(plain.contains("<1> "));
    assert!(plain.contains("[4]"));
    assert!(plain.contains("Total: 0 MB"));

    let mut done = Bitfield::new(3);
    done.set(0);
    done.set(1);
    let with_completion = engine.summary(Some(&done));
    assert!(with_completion.contains("2/2 (100%)"));
    assert!(with_completion.contains("0/1 (0%)"));
}
