use std::sync::Once;

use dbx_store::storage::{NodeStore, StoreOptions};
use dbx_store::{DocumentId, Pointer, Result, StoreError};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const PER_PAGE: usize = (4096 - 32) / (6 + 100);

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

fn node(i: usize) -> Vec<u8> {
    let mut value = format!("<n id=\"{i}\"/>").into_bytes();
    value.resize(100, b' ');
    value
}

fn create() -> (TempDir, std::path::PathBuf, NodeStore) {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("nodes.dbx");
    let store = NodeStore::create(&path, StoreOptions::default()).unwrap();
    (dir, path, store)
}

fn fill(store: &NodeStore, doc: DocumentId, count: usize) -> Result<Vec<Pointer>> {
    (0..count).map(|i| store.append(doc, &node(i))).collect()
}

fn scan_all(store: &NodeStore, start: Pointer) -> Result<Vec<(Pointer, Vec<u8>)>> {
    let mut seen = Vec::new();
    store.scan(start.page(), |pointer, value| {
        seen.push((pointer, value.to_vec()));
        true
    })?;
    Ok(seen)
}

#[test]
fn appends_fill_linked_pages_in_document_order() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(1);
    let pointers = fill(&store, doc, 100)?;
    assert!(pointers[..PER_PAGE].iter().all(|p| p.page() == pointers[0].page()));
    assert_ne!(pointers[PER_PAGE].page(), pointers[0].page());

    let seen = scan_all(&store, pointers[0])?;
    assert_eq!(seen.len(), 100);
    for (i, (pointer, value)) in seen.iter().enumerate() {
        assert_eq!(*pointer, pointers[i]);
        assert_eq!(*value, node(i));
    }

    let mut stopped = 0;
    let visited = store.scan(pointers[0].page(), |_, _| {
        stopped += 1;
        stopped < 5
    })?;
    assert_eq!(visited, 5);
    Ok(())
}

#[test]
fn split_moves_tail_nodes_and_reports_them() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(7);
    let pointers = fill(&store, doc, 100)?;
    let first_page = pointers[0].page();

    let mut moved = Vec::new();
    let inserted = store.insert_after(doc, pointers[10], &[b'i'; 200], &mut |old: Pointer, new: Pointer| {
        moved.push((old, new))
    })?;
    assert_eq!(inserted.page(), first_page);
    assert_eq!(moved.len(), PER_PAGE - 11);
    for (i, (old, new)) in moved.iter().enumerate() {
        assert_eq!(*old, pointers[11 + i]);
        assert_ne!(new.page(), first_page);
        assert_eq!(new.slot(), old.slot());
        assert_eq!(store.get(*new)?, node(11 + i));
        assert_eq!(store.get(*old)?, node(11 + i));
    }

    let seen = scan_all(&store, pointers[0])?;
    assert_eq!(seen.len(), 101);
    assert_eq!(seen[10].1, node(10));
    assert_eq!(seen[11], (inserted, vec![b'i'; 200]));
    assert_eq!(seen[12].1, node(11));
    assert_eq!(seen[100].1, node(99));

    let next = store.append(doc, &node(100))?;
    assert_eq!(next.page(), pointers[99].page());
    assert!(store.verify()?.success);
    Ok(())
}

#[test]
fn removed_pointer_never_resolves_to_a_later_page() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(5);
    let pointers = fill(&store, doc, PER_PAGE + 1)?;
    let first = pointers[0];
    assert_eq!(pointers[PER_PAGE].slot(), first.slot());

    store.remove(first)?;
    assert!(matches!(store.get(first), Err(StoreError::SlotNotFound { .. })));
    assert!(matches!(store.remove(first), Err(StoreError::SlotNotFound { .. })));
    assert_eq!(store.get(pointers[PER_PAGE])?, node(PER_PAGE));

    let seen = scan_all(&store, pointers[1])?;
    assert_eq!(seen.len(), PER_PAGE);
    assert_eq!(seen[PER_PAGE - 1], (pointers[PER_PAGE], node(PER_PAGE)));
    Ok(())
}

#[test]
fn removing_a_moved_node_by_its_old_pointer_drops_the_link() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(8);
    let pointers = fill(&store, doc, PER_PAGE)?;
    let mut moved = Vec::new();
    store.insert_after(doc, pointers[10], &[b'i'; 200], &mut |old: Pointer, new: Pointer| {
        moved.push((old, new))
    })?;
    assert_eq!(store.verify()?.counts.forward_links, moved.len() as u64);

    let (old, new) = moved[0];
    store.remove(old)?;
    assert!(matches!(store.get(old), Err(StoreError::SlotNotFound { .. })));
    assert!(matches!(store.get(new), Err(StoreError::SlotNotFound { .. })));
    assert!(matches!(store.remove(old), Err(StoreError::SlotNotFound { .. })));
    assert_eq!(store.get(moved[1].0)?, node(12));

    let report = store.verify()?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.forward_links, moved.len() as u64 - 1);
    Ok(())
}

#[test]
fn links_into_a_reclaimed_page_are_dropped() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(9);
    let pointers = fill(&store, doc, PER_PAGE)?;
    let mut moved = Vec::new();
    let inserted = store.insert_after(doc, pointers[10], &[b'i'; 200], &mut |old: Pointer, new: Pointer| {
        moved.push((old, new))
    })?;

    for (_, new) in &moved {
        store.remove(*new)?;
    }
    let report = store.verify()?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.forward_links, 0);
    for (old, _) in &moved {
        assert!(matches!(store.get(*old), Err(StoreError::SlotNotFound { .. })));
    }

    let seen = scan_all(&store, pointers[0])?;
    assert_eq!(seen.len(), 12);
    assert_eq!(seen[11].0, inserted);
    Ok(())
}

#[test]
fn insert_after_last_node_of_full_page_lands_on_new_page() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(2);
    let pointers = fill(&store, doc, PER_PAGE + 3)?;
    let last_on_first = pointers[PER_PAGE - 1];

    let mut moved = 0;
    let inserted = store.insert_after(doc, last_on_first, &[b'z'; 300], &mut |_: Pointer, _: Pointer| moved += 1)?;
    assert_eq!(moved, 0);
    assert_ne!(inserted.page(), last_on_first.page());
    assert_ne!(inserted.page(), pointers[PER_PAGE].page());

    let seen = scan_all(&store, pointers[0])?;
    assert_eq!(seen.len(), PER_PAGE + 4);
    assert_eq!(seen[PER_PAGE], (inserted, vec![b'z'; 300]));
    assert_eq!(seen[PER_PAGE + 1].0, pointers[PER_PAGE]);
    Ok(())
}

#[test]
fn emptied_page_is_unlinked_and_reused() -> Result<()> {
    let (_dir, _path, store) = create();
    let doc = DocumentId(3);
    let pointers = fill(&store, doc, 3 * PER_PAGE)?;
    let middle = pointers[PER_PAGE].page();

    for pointer in &pointers[PER_PAGE..2 * PER_PAGE] {
        store.remove(*pointer)?;
    }
    assert!(matches!(
        store.get(pointers[PER_PAGE]),
        Err(StoreError::SlotNotFound { .. })
    ));
    let seen = scan_all(&store, pointers[0])?;
    assert_eq!(seen.len(), 2 * PER_PAGE);
    assert_eq!(seen[PER_PAGE].0, pointers[2 * PER_PAGE]);
    assert!(store.verify()?.success);

    for pointer in &pointers[2 * PER_PAGE..] {
        store.remove(*pointer)?;
    }
    let reused = store.append(doc, &node(999))?;
    assert_eq!(reused.page(), pointers[2 * PER_PAGE].page());
    assert_ne!(reused.page(), middle);
    let seen = scan_all(&store, pointers[0])?;
    assert_eq!(seen.len(), PER_PAGE + 1);
    assert_eq!(seen[PER_PAGE].1, node(999));
    Ok(())
}

#[test]
fn documents_keep_separate_page_runs() -> Result<()> {
    let (_dir, _path, store) = create();
    let (a, b) = (DocumentId(10), DocumentId(11));
    let mut first_a = None;
    let mut first_b = None;
    for i in 0..60 {
        let pa = store.append(a, &node(i))?;
        let pb = store.append(b, &node(1_000 + i))?;
        first_a.get_or_insert(pa);
        first_b.get_or_insert(pb);
    }
    let only_a = scan_all(&store, first_a.unwrap())?;
    let only_b = scan_all(&store, first_b.unwrap())?;
    assert_eq!(only_a.len(), 60);
    assert_eq!(only_b.len(), 60);
    assert_eq!(only_b[59].1, node(1_059));

    store.close_document(a)?;
    let fresh = store.append(a, &node(60))?;
    assert!(only_a.iter().all(|(p, _)| p.page() != fresh.page()));
    Ok(())
}

#[test]
fn nodes_survive_reopen_and_update_keeps_size() -> Result<()> {
    let (_dir, path, store) = create();
    let doc = DocumentId(4);
    let small = store.append(doc, b"<root>")?;
    let big = store.append(doc, &vec![b'b'; 9_000])?;
    store.update(small, b"<ROOT>")?;
    assert!(matches!(store.update(small, b"<root/>"), Err(StoreError::Invalid(_))));
    store.close()?;

    let store = NodeStore::open(&path, StoreOptions::default())?;
    assert_eq!(store.get(small)?, b"<ROOT>");
    assert_eq!(store.get(big)?, vec![b'b'; 9_000]);
    let seen = scan_all(&store, small)?;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].1.len(), 9_000);

    let report = store.verify()?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.chain_heads, 1);
    Ok(())
}
