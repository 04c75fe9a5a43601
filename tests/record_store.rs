#![allow(clippy::useless_vec)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Bound;
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use dbx_store::storage::{
    CodecKind, CounterMetrics, KeyPredicate, Lookup, MemoryIndex, RecordStore, StoreOptions,
    ValueIndex, ValueShape,
};
use dbx_store::types::page::PageStatus;
use dbx_store::{PageNo, Pointer, Result, StoreError};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const WORK: usize = 4096 - 32;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dbx_store=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn create(options: StoreOptions) -> (TempDir, std::path::PathBuf, RecordStore) {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("records.dbx");
    let store = RecordStore::create(&path, options).unwrap();
    (dir, path, store)
}

fn chain_pages(store: &RecordStore, pointer: Pointer) -> Vec<PageNo> {
    match store.shape(pointer).unwrap() {
        ValueShape::Overflow { pages } => pages,
        ValueShape::SinglePage => panic!("{pointer} is not an overflow value"),
    }
}

#[test]
fn values_round_trip_across_reopen() -> Result<()> {
    let (_dir, path, store) = create(StoreOptions::default().buffer_pages(8));
    let sizes = [0, 1, 100, WORK - 6, WORK - 5, WORK, WORK + 1, 10_000, 3 * 4096 + 7, 50_000];
    let mut stored = Vec::new();
    for (seed, len) in sizes.iter().enumerate() {
        let value = payload(*len, seed as u64);
        let pointer = store.store(&value)?;
        assert_eq!(store.fetch(pointer)?, value, "len {len}");
        stored.push((pointer, value));
    }
    store.close()?;

    let store = RecordStore::open(&path, StoreOptions::default())?;
    for (pointer, value) in &stored {
        assert_eq!(&store.fetch(*pointer)?, value);
    }
    Ok(())
}

#[test]
fn overflow_threshold_is_work_area_minus_slot_overhead() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let fits = store.store(&payload(WORK - 6, 1))?;
    assert_eq!(store.shape(fits)?, ValueShape::SinglePage);

    let one = store.store(&payload(WORK - 5, 2))?;
    assert_eq!(chain_pages(&store, one).len(), 1);
    let two = store.store(&payload(2 * WORK, 3))?;
    assert_eq!(chain_pages(&store, two).len(), 2);
    let three = store.store(&payload(2 * WORK + 1, 4))?;
    assert_eq!(chain_pages(&store, three).len(), 3);
    Ok(())
}

#[test]
fn ten_thousand_bytes_make_a_three_page_chain() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let value = payload(10_000, 7);
    let pointer = store.store(&value)?;
    let pages = chain_pages(&store, pointer);
    assert_eq!(pages.len(), 3);

    let head = store.page_snapshot(pages[0])?;
    assert_eq!(head.status(), PageStatus::MultiPage);
    assert_eq!(head.data_len(), 10_000);
    assert_eq!(head.last_in_chain(), Some(pages[2]));
    assert_eq!(store.page_snapshot(pages[1])?.data_len(), WORK);
    assert_eq!(store.page_snapshot(pages[2])?.data_len(), 10_000 - 2 * WORK);

    let read = store.fetch(pointer)?;
    assert_eq!(read.len(), 10_000);
    assert_eq!(read, value);
    Ok(())
}

#[test]
fn update_collapses_and_expands() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let big = store.store(&payload(10_000, 11))?;
    let old_pages = chain_pages(&store, big);

    let short = store.update(big, b"short now")?;
    assert_ne!(short, big);
    assert_eq!(store.fetch(short)?, b"short now");
    assert_eq!(store.shape(short)?, ValueShape::SinglePage);
    for page in &old_pages {
        let status = store.page_snapshot(*page)?.status();
        assert!(
            status != PageStatus::MultiPage && status != PageStatus::Lob,
            "page {page} still belongs to a chain"
        );
    }
    assert!(matches!(store.fetch(big), Err(StoreError::SlotNotFound { .. })));

    let grown_value = payload(9_000, 12);
    let grown = store.update(short, &grown_value)?;
    assert_ne!(grown, short);
    assert_eq!(chain_pages(&store, grown).len(), 3);
    assert_eq!(store.fetch(grown)?, grown_value);

    let rewritten = payload(12_500, 13);
    assert_eq!(store.update(grown, &rewritten)?, grown);
    assert_eq!(chain_pages(&store, grown).len(), 4);
    assert_eq!(store.fetch(grown)?, rewritten);
    Ok(())
}

#[test]
fn empty_page_is_reclaimed_and_partial_page_is_reused() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let lone = store.store(&payload(100, 21))?;
    let page = lone.page();
    store.remove(lone)?;
    assert_eq!(store.page_snapshot(page)?.status(), PageStatus::FreeList);
    assert!(store.free_space()?.iter().all(|entry| entry.page != page));

    let a = store.store(&payload(100, 22))?;
    let b = store.store(&payload(100, 23))?;
    assert_eq!(a.page(), b.page());
    store.remove(a)?;
    let entry = store
        .free_space()?
        .into_iter()
        .find(|entry| entry.page == b.page())
        .expect("partially used page stays registered");
    assert_eq!(entry.free as usize, WORK - 106);

    let c = store.store(&payload(100, 24))?;
    assert_eq!(c.page(), b.page());
    assert_eq!(store.fetch(b)?, payload(100, 23));
    Ok(())
}

#[test]
fn removing_twice_reports_missing_slot() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let keep = store.store(b"keep me")?;
    let gone = store.store(b"remove me")?;
    store.remove(gone)?;
    let err = store.remove(gone).unwrap_err();
    assert!(matches!(err, StoreError::SlotNotFound { pointer } if pointer == gone));
    assert!(err.is_structural());
    assert_eq!(store.fetch(keep)?, b"keep me");

    let chain = store.store(&payload(9_000, 31))?;
    store.remove(chain)?;
    assert!(matches!(store.remove(chain), Err(StoreError::SlotNotFound { .. })));
    assert!(store.verify()?.success);
    Ok(())
}

#[test]
fn compaction_keeps_surviving_pointers_valid() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let pointers: Vec<Pointer> = (0..10u8).map(|i| store.store(&[i; 50]).unwrap()).collect();
    let page = pointers[0].page();
    assert!(pointers.iter().all(|p| p.page() == page));
    let before = store.page_snapshot(page)?;
    assert_eq!(before.record_count(), 10);

    for pointer in &pointers[..5] {
        store.remove(*pointer)?;
    }
    let after = store.page_snapshot(page)?;
    assert_eq!(before.data_len() - after.data_len(), 5 * (6 + 50));
    assert_eq!(after.record_count(), 5);
    for (i, pointer) in pointers.iter().enumerate().skip(5) {
        assert_eq!(store.fetch(*pointer)?, vec![i as u8; 50]);
    }
    Ok(())
}

#[test]
fn append_grows_in_place_then_relocates_then_chains() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let mut expected = payload(100, 41);
    let first = store.store(&expected)?;

    let more = payload(50, 42);
    assert_eq!(store.append(first, &more)?, first);
    expected.extend_from_slice(&more);
    assert_eq!(store.fetch(first)?, expected);

    store.store(b"neighbour")?;
    let tail = payload(10, 43);
    let moved = store.append(first, &tail)?;
    assert_ne!(moved, first);
    expected.extend_from_slice(&tail);
    assert_eq!(store.fetch(moved)?, expected);

    let bulk = payload(5_000, 44);
    let chained = store.append(moved, &bulk)?;
    expected.extend_from_slice(&bulk);
    assert!(matches!(store.shape(chained)?, ValueShape::Overflow { .. }));
    assert_eq!(store.fetch(chained)?, expected);

    let rest = payload(3_000, 45);
    assert_eq!(store.append(chained, &rest)?, chained);
    expected.extend_from_slice(&rest);
    assert_eq!(store.fetch(chained)?, expected);
    assert_eq!(chain_pages(&store, chained).len(), expected.len().div_ceil(WORK));
    Ok(())
}

#[test]
fn registry_and_free_chain_survive_reopen() -> Result<()> {
    let (_dir, path, store) = create(StoreOptions::default());
    let mut kept = Vec::new();
    for i in 0..40u64 {
        let pointer = store.store(&payload(300, i))?;
        if i % 3 == 0 {
            store.remove(pointer)?;
        } else {
            kept.push((pointer, i));
        }
    }
    let chain = store.store(&payload(20_000, 99))?;
    store.remove(chain)?;
    let registry = store.free_space()?;
    let header = store.file_header()?;
    store.close()?;

    let store = RecordStore::open(&path, StoreOptions::default())?;
    assert_eq!(store.free_space()?, registry);
    assert_eq!(store.file_header()?.free_head, header.free_head);
    for (pointer, seed) in kept {
        assert_eq!(store.fetch(pointer)?, payload(300, seed));
    }
    Ok(())
}

#[test]
fn read_only_store_rejects_mutations() -> Result<()> {
    let (_dir, path, store) = create(StoreOptions::default());
    let pointer = store.store(b"frozen")?;
    store.close()?;

    let store = RecordStore::open(&path, StoreOptions::default().read_only(true))?;
    assert_eq!(store.fetch(pointer)?, b"frozen");
    assert!(matches!(store.store(b"x"), Err(StoreError::ReadOnly)));
    assert!(matches!(store.remove(pointer), Err(StoreError::ReadOnly)));
    assert!(matches!(store.update(pointer, b"thawed"), Err(StoreError::ReadOnly)));
    assert!(matches!(store.append(pointer, b"!"), Err(StoreError::ReadOnly)));
    Ok(())
}

#[test]
fn damaged_page_is_reported_as_corruption() -> Result<()> {
    let (_dir, path, store) = create(StoreOptions::default());
    let pointer = store.store(b"soon damaged")?;
    store.close()?;

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(u64::from(pointer.page().0) * 4096 + 40))
        .unwrap();
    file.write_all(b"garbage").unwrap();
    drop(file);

    let store = RecordStore::open(&path, StoreOptions::default())?;
    match store.fetch(pointer) {
        Err(StoreError::Corruption(report)) => {
            assert_eq!(report.page, Some(pointer.page()));
            assert!(report.expected.is_some() && report.found.is_some());
        }
        other => panic!("expected corruption, got {other:?}"),
    }
    assert!(matches!(
        store.fetch(Pointer::new(PageNo(500), 0)),
        Err(StoreError::Corruption(_))
    ));
    Ok(())
}

/// Index that signals, then holds the write lock for a while on every insert.
struct SlowIndex {
    inner: MemoryIndex,
    entered: Mutex<Option<mpsc::Sender<()>>>,
}

impl ValueIndex for SlowIndex {
    fn find_value(&self, key: &[u8]) -> Result<Lookup> {
        self.inner.find_value(key)
    }

    fn add_value(&mut self, key: &[u8], pointer: Pointer) -> Result<()> {
        if let Some(tx) = self.entered.lock().unwrap().take() {
            let _ = tx.send(());
            thread::sleep(Duration::from_millis(400));
        }
        self.inner.add_value(key, pointer)
    }

    fn remove_value(&mut self, key: &[u8]) -> Result<Lookup> {
        self.inner.remove_value(key)
    }

    fn query(&self, predicate: &KeyPredicate) -> Result<Vec<(Vec<u8>, Pointer)>> {
        self.inner.query(predicate)
    }
}

#[test]
fn contended_lock_times_out_as_retryable() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    let index = SlowIndex {
        inner: MemoryIndex::new(),
        entered: Mutex::new(Some(tx)),
    };
    let options = StoreOptions::default().lock_timeout(Duration::from_millis(50));
    let store = Arc::new(RecordStore::create_with_index(
        dir.path().join("slow.dbx"),
        options,
        index,
    )?);
    let pointer = store.store(b"contended")?;

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.put(b"key", b"value"))
    };
    rx.recv().unwrap();
    let err = store.fetch(pointer).unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout { .. }));
    assert!(err.is_retryable());

    writer.join().unwrap()?;
    assert_eq!(store.fetch(pointer)?, b"contended");
    assert_eq!(store.get(b"key")?, Some(b"value".to_vec()));
    Ok(())
}

#[test]
fn snappy_codec_is_taken_from_the_header() -> Result<()> {
    let (_dir, path, store) = create(StoreOptions::default().codec(CodecKind::Snappy));
    let value = vec![b'a'; 10_000];
    let pointer = store.store(&value)?;
    assert_eq!(store.shape(pointer)?, ValueShape::SinglePage);
    assert!(matches!(store.append(pointer, b"more"), Err(StoreError::Invalid(_))));
    store.close()?;

    let store = RecordStore::open(&path, StoreOptions::default())?;
    assert_eq!(store.fetch(pointer)?, value);
    Ok(())
}

#[test]
fn keyed_operations_follow_relocated_values() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let first = store.put(b"alpha", b"one")?;
    store.put(b"beta", b"two")?;
    store.put(b"gamma", &payload(9_000, 51))?;

    assert_eq!(store.put_if_absent(b"alpha", b"ignored")?, None);
    assert!(store.put_if_absent(b"delta", b"four")?.is_some());
    assert_eq!(store.get(b"alpha")?, Some(b"one".to_vec()));

    let grown = store.put(b"alpha", &payload(6_000, 52))?;
    assert_ne!(grown, first);
    assert_eq!(store.get(b"alpha")?, Some(payload(6_000, 52)));

    assert_eq!(store.update_key(b"missing", b"x")?, None);
    store.update_key(b"gamma", b"small again")?;
    assert_eq!(store.get(b"gamma")?, Some(b"small again".to_vec()));

    store.append_key(b"beta", b"+three")?;
    store.append_key(b"epsilon", b"new")?;
    assert_eq!(store.get(b"beta")?, Some(b"two+three".to_vec()));
    assert_eq!(store.get(b"epsilon")?, Some(b"new".to_vec()));

    assert!(store.remove_key(b"delta")?);
    assert!(!store.remove_key(b"delta")?);
    assert!(!store.contains_key(b"delta")?);

    let keys = store.keys()?;
    assert_eq!(
        keys,
        vec![b"alpha".to_vec(), b"beta".to_vec(), b"epsilon".to_vec(), b"gamma".to_vec()]
    );
    let ranged = store.find(&KeyPredicate::Range(
        Bound::Included(b"b".to_vec()),
        Bound::Excluded(b"f".to_vec()),
    ))?;
    assert_eq!(
        ranged,
        vec![
            (b"beta".to_vec(), b"two+three".to_vec()),
            (b"epsilon".to_vec(), b"new".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn metrics_are_counted_per_store() -> Result<()> {
    let (_dir, _path, store) = create(StoreOptions::default());
    let metrics = Arc::new(CounterMetrics::default());
    let store = store.with_metrics(metrics.clone());

    let small = store.store(b"tiny")?;
    let big = store.store(&payload(9_000, 61))?;
    store.update(big, b"collapsed")?;
    store.append(small, b"!")?;
    store.remove(small)?;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.overflow_stored, 1);
    assert_eq!(snapshot.inline_stored, 2);
    assert_eq!(snapshot.chains_collapsed, 1);
    assert_eq!(snapshot.appends, 1);
    assert_eq!(snapshot.appended_bytes, 1);
    assert_eq!(snapshot.removed, 1);
    Ok(())
}
