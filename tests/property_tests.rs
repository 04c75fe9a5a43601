use proptest::prelude::*;

use dbx_store::storage::{FreeSpaceRegistry, RecordStore, StoreOptions};
use dbx_store::{PageNo, Pointer};

#[derive(Debug, Clone)]
enum Operation {
    Store { len: usize, fill: u8 },
    Update { target: usize, len: usize, fill: u8 },
    Append { target: usize, len: usize, fill: u8 },
    Remove { target: usize },
}

fn arb_len() -> impl Strategy<Value = usize> {
    prop_oneof![
        4 => 0usize..300,
        2 => 3_900usize..4_200,
        1 => 4_200usize..20_000,
    ]
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (arb_len(), any::<u8>()).prop_map(|(len, fill)| Operation::Store { len, fill }),
        2 => (any::<usize>(), arb_len(), any::<u8>())
            .prop_map(|(target, len, fill)| Operation::Update { target, len, fill }),
        2 => (any::<usize>(), 0usize..2_000, any::<u8>())
            .prop_map(|(target, len, fill)| Operation::Append { target, len, fill }),
        1 => any::<usize>().prop_map(|target| Operation::Remove { target }),
    ]
}

fn value(len: usize, fill: u8) -> Vec<u8> {
    (0..len).map(|i| fill.wrapping_add(i as u8)).collect()
}

proptest! {
    #[test]
    fn prop_pointer_fields_survive_large_pages(page in (1u32 << 16)..=u32::MAX, slot in any::<u16>(), tag in any::<u16>()) {
        let pointer = Pointer::new(PageNo(page), slot).with_tag(tag);
        prop_assert_eq!(pointer.decode(), (PageNo(page), slot));
        prop_assert_eq!(pointer.tag(), tag);
        prop_assert_eq!(Pointer::from_u64(pointer.to_u64()), pointer);
        prop_assert_eq!(pointer.address(), Pointer::new(PageNo(page), slot));
    }

    #[test]
    fn prop_registry_stays_sorted_and_bounded(
        updates in prop::collection::vec((1u32..40, 0u32..4_064, any::<bool>()), 1..200)
    ) {
        let mut registry = FreeSpaceRegistry::new(16, 64);
        for (page, free, forget) in updates {
            if forget {
                registry.forget(PageNo(page));
            } else {
                registry.record(PageNo(page), free);
            }
            let entries = registry.entries();
            prop_assert!(entries.len() <= 16);
            prop_assert!(entries.iter().all(|e| e.free > 64));
            prop_assert!(entries.windows(2).all(|w| (w[0].free, w[0].page) <= (w[1].free, w[1].page)));
            let mut pages: Vec<_> = entries.iter().map(|e| e.page).collect();
            pages.sort_unstable();
            pages.dedup();
            prop_assert_eq!(pages.len(), entries.len());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_store_matches_model(ops in prop::collection::vec(arb_operation(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.dbx");
        let store = RecordStore::create(&path, StoreOptions::default().buffer_pages(6)).unwrap();
        let mut live: Vec<(Pointer, Vec<u8>)> = Vec::new();

        for op in ops {
            match op {
                Operation::Store { len, fill } => {
                    let data = value(len, fill);
                    let pointer = store.store(&data).unwrap();
                    live.push((pointer, data));
                }
                Operation::Update { target, len, fill } if !live.is_empty() => {
                    let idx = target % live.len();
                    let data = value(len, fill);
                    let pointer = store.update(live[idx].0, &data).unwrap();
                    live[idx] = (pointer, data);
                }
                Operation::Append { target, len, fill } if !live.is_empty() => {
                    let idx = target % live.len();
                    let chunk = value(len, fill);
                    let pointer = store.append(live[idx].0, &chunk).unwrap();
                    live[idx].0 = pointer;
                    live[idx].1.extend_from_slice(&chunk);
                }
                Operation::Remove { target } if !live.is_empty() => {
                    let idx = target % live.len();
                    let (pointer, _) = live.swap_remove(idx);
                    store.remove(pointer).unwrap();
                    prop_assert!(store.fetch(pointer).is_err());
                }
                _ => {}
            }
            for (pointer, data) in &live {
                prop_assert_eq!(&store.fetch(*pointer).unwrap(), data);
            }
        }

        let report = store.verify().unwrap();
        prop_assert!(report.success, "{:?}", report.findings);
        store.close().unwrap();

        let store = RecordStore::open(&path, StoreOptions::default()).unwrap();
        for (pointer, data) in &live {
            prop_assert_eq!(&store.fetch(*pointer).unwrap(), data);
        }
    }
}
