//! Integration tests for the feature store.

use featurestore::{
    ChunkHint, FeatureMatrix, FeatureStore, GroupData, StoreConfig, Verdict, WriteOptions,
};
use std::num::NonZeroU64;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        chunk_cache_size: 32,
        create_if_missing: true,
        default_chunk_hint: ChunkHint::Records(NonZeroU64::new(16).unwrap()),
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A corpus of `n` items named `{root}_{k}`, item `k` having `k % 7 + 1`
/// frames of dimension `dim`.
fn corpus(
    root: &str,
    range: std::ops::Range<usize>,
    dim: usize,
) -> (Vec<String>, Vec<Vec<f64>>, Vec<FeatureMatrix>) {
    let mut items = Vec::new();
    let mut times = Vec::new();
    let mut features = Vec::new();
    for k in range {
        let frames = k % 7 + 1;
        items.push(format!("{}_{}", root, k));
        times.push((0..frames).map(|f| f as f64 * 0.01).collect());
        let data = (0..frames * dim).map(|v| (k * 1000 + v) as f64).collect();
        features.push(FeatureMatrix::new(dim, data).unwrap());
    }
    (items, times, features)
}

// --- Realistic Workflow Tests ---

#[test]
fn test_write_read_roundtrip() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let (items, times, features) = corpus("File", 0..30, 20);
    store
        .write("features", items.clone(), times.clone(), features.clone())
        .unwrap();

    let data: GroupData<String> = store.read("features").unwrap();
    assert_eq!(data.items, items);
    for (k, entry) in data.entries.iter().enumerate() {
        assert_eq!(entry.times, times[k]);
        assert_eq!(entry.features, features[k]);
    }
}

#[test]
fn test_incremental_sessions() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // Three write sessions, each reopening the store
    for range in [0..10, 10..25, 25..40] {
        let store = FeatureStore::open_or_create(config.clone()).unwrap();
        let (items, times, features) = corpus("utt", range, 4);
        let report = store.write("mfcc", items, times, features).unwrap();
        assert_eq!(report.verdict, Verdict::Appendable);
    }

    let store = FeatureStore::open(config).unwrap();
    let data: GroupData<String> = store.read("mfcc").unwrap();
    let (expected, _, features) = corpus("utt", 0..40, 4);
    assert_eq!(data.items, expected);
    assert_eq!(data.entries[39].features, features[39]);
}

#[test]
fn test_resume_interrupted_item() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let (items, times, features) = corpus("File", 0..3, 3);
    store.write("g", items, times.clone(), features.clone()).unwrap();

    // The next session starts again from the last item
    let (items, new_times, new_features) = corpus("File", 2..6, 3);
    let report = store.write("g", items, new_times.clone(), new_features.clone()).unwrap();
    assert_eq!(report.verdict, Verdict::AppendableWithTrim);
    assert_eq!(report.items_written, 3);

    let data: GroupData<String> = store.read("g").unwrap();
    let (expected, _, _) = corpus("File", 0..6, 3);
    assert_eq!(data.items, expected);

    // The resumed item keeps its first-session rows
    assert_eq!(data.entries[2].times, times[2]);
    assert_eq!(data.entries[2].features, features[2]);
    assert_eq!(data.entries[3].features, new_features[1]);
}

#[test]
fn test_append_single_new_item() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let (items, times, features) = corpus("File", 0..30, 5);
    store.write("group", items, times, features).unwrap();

    let added = FeatureMatrix::zeros(1, 5).unwrap();
    store
        .write("group", vec!["File_31".to_string()], vec![vec![0.0]], vec![added.clone()])
        .unwrap();

    let item = store.read_item("group", &"File_31".to_string()).unwrap();
    assert_eq!(item.features, added);
    assert_eq!(store.read::<String>("group").unwrap().len(), 31);
}

#[test]
fn test_simple_write_named_item() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let times: Vec<f64> = (0..300).map(|f| f as f64 * 2.0 / 299.0).collect();
    let features = FeatureMatrix::new(20, vec![0.25; 300 * 20]).unwrap();
    store
        .simple_write("group1", times.clone(), features.clone(), Some("item"))
        .unwrap();

    let data: GroupData<String> = store.read("group1").unwrap();
    assert_eq!(data.items, vec!["item"]);
    assert_eq!(data.entries[0].times, times);
    assert_eq!(data.entries[0].features.frames(), 300);
}

#[test]
fn test_numeric_item_identifiers() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let features = vec![FeatureMatrix::zeros(2, 3).unwrap(); 3];
    store
        .write("ids", vec![7u64, 3, 11], vec![vec![0.0, 0.5]; 3], features.clone())
        .unwrap();
    let report = store
        .write("ids", vec![11u64, 12], vec![vec![0.0, 0.5]; 2], features[..2].to_vec())
        .unwrap();
    assert_eq!(report.verdict, Verdict::AppendableWithTrim);

    let data: GroupData<u64> = store.read("ids").unwrap();
    assert_eq!(data.items, vec![7, 3, 11, 12]);
}

#[test]
fn test_groups_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let (items, times, features) = corpus("a", 0..5, 2);
    store.write("mfcc", items.clone(), times.clone(), features).unwrap();

    // Same items with another dimension in another group
    let (_, _, wide) = corpus("a", 0..5, 8);
    store.write("fbank", items, times, wide).unwrap();

    assert_eq!(store.list_groups().unwrap(), vec!["fbank", "mfcc"]);
    let stats = store.stats().unwrap();
    assert_eq!(stats.group_count, 2);
    assert_eq!(stats.item_count, 10);
}

#[test]
fn test_explicit_chunk_hint() {
    let dir = TempDir::new().unwrap();
    let store = FeatureStore::create(test_config(&dir)).unwrap();

    let options = WriteOptions {
        chunk_hint: Some(ChunkHint::Records(NonZeroU64::new(3).unwrap())),
        ..Default::default()
    };
    let (items, times, features) = corpus("x", 0..20, 6);
    store
        .write_with_options("g", items.clone(), times, features, &options)
        .unwrap();

    let chunk_files = std::fs::read_dir(store.path().join("groups").join("g").join("features"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("chunk-"))
        .count();
    assert!(chunk_files > 1);

    let data: GroupData<String> = store.read("g").unwrap();
    assert_eq!(data.items, items);
}

#[test]
fn test_reopen_after_drop_reads_same_data() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let first = {
        let store = FeatureStore::create(config.clone()).unwrap();
        let (items, times, features) = corpus("r", 0..12, 3);
        store.write("g", items, times, features).unwrap();
        store.read::<String>("g").unwrap()
    };

    let store = FeatureStore::open(config).unwrap();
    let second: GroupData<String> = store.read("g").unwrap();
    let third: GroupData<String> = store.read("g").unwrap();
    assert_eq!(first, second);
    assert_eq!(second, third);
}
