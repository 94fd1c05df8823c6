//! Projection scenarios across several writers
//!
//! Stores run with `live = false` and entries are copied between them by hand,
//! so every step of the projection is explicit.

mod common;

use braidstore_core::{
    AddOptions, MemberState, RangeOptions, RemoveOptions, StoreError, StoreEvent,
};
use common::{del, replicate, set, swap, TestStore};
use proptest::prelude::*;

// ============================================================================
// Causal ordering
// ============================================================================

#[tokio::test]
async fn test_causally_later_write_wins_until_destroyed() {
    let a = TestStore::new("scenario", false).await;
    let b = TestStore::new("scenario", false).await;
    let key_a = a.writer_key();
    let key_b = b.writer_key();

    a.append("default", &set("k", "v1")).unwrap();
    assert_eq!(a.text("k").as_deref(), Some("v1"));

    // B observes A's entry before writing
    b.add_writer("default", key_a, AddOptions::default()).unwrap();
    replicate(&a, &b, &key_a);
    b.update("default").unwrap();
    assert_eq!(b.text("k").as_deref(), Some("v1"));

    b.append("default", &set("k", "v2")).unwrap();
    assert_eq!(b.text("k").as_deref(), Some("v2"));

    a.add_writer("default", key_b, AddOptions::default()).unwrap();
    replicate(&b, &a, &key_b);
    a.update("default").unwrap();
    assert_eq!(a.text("k").as_deref(), Some("v2"));

    a.remove_writer("default", key_b, RemoveOptions::destroy())
        .unwrap();
    a.rebuild("default").unwrap();
    assert_eq!(a.text("k").as_deref(), Some("v1"));
    assert_eq!(a.logs().length(&key_b), 0);
}

#[tokio::test]
async fn test_third_replica_waits_for_missing_dependency() {
    let a = TestStore::new("three", false).await;
    let b = TestStore::new("three", false).await;
    let c = TestStore::new("three", false).await;
    let key_a = a.writer_key();
    let key_b = b.writer_key();

    a.append("default", &set("k", "v1")).unwrap();
    b.add_writer("default", key_a, AddOptions::default()).unwrap();
    replicate(&a, &b, &key_a);
    b.update("default").unwrap();
    b.append("default", &set("k", "v2")).unwrap();
    assert_eq!(b.text("k").as_deref(), Some("v2"));

    c.add_writer("default", key_a, AddOptions::default()).unwrap();
    c.add_writer("default", key_b, AddOptions::default()).unwrap();

    // B's entry arrives first and must wait for the A entry it saw
    replicate(&b, &c, &key_b);
    assert_eq!(c.update("default").unwrap(), 0);
    assert_eq!(c.text("k"), None);

    replicate(&a, &c, &key_a);
    assert_eq!(c.update("default").unwrap(), 2);
    assert_eq!(c.text("k").as_deref(), Some("v2"));
    assert_eq!(c.text("k"), b.text("k"));

    c.rebuild("default").unwrap();
    assert_eq!(c.text("k").as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_rejected_operation_is_not_logged() {
    let a = TestStore::new("reject", false).await;
    let b = TestStore::new("reject", false).await;
    let key_a = a.writer_key();

    a.append("default", &set("k", "v1")).unwrap();
    assert!(matches!(
        a.append("default", &swap("k", "stale", "v3")),
        Err(StoreError::InvalidOperation(_))
    ));
    assert_eq!(a.logs().length(&key_a), 1);

    a.append("default", &swap("k", "v1", "v2")).unwrap();
    assert_eq!(a.text("k").as_deref(), Some("v2"));

    // replicas only ever see accepted operations
    b.add_writer("default", key_a, AddOptions::default()).unwrap();
    replicate(&a, &b, &key_a);
    assert_eq!(b.update("default").unwrap(), 2);
    assert_eq!(b.text("k").as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_frozen_writer_keeps_history_only() {
    let a = TestStore::new("freeze", false).await;
    let b = TestStore::new("freeze", false).await;
    let key_b = b.writer_key();

    b.append("default", &set("early", "1")).unwrap();
    a.add_writer("default", key_b, AddOptions::default()).unwrap();
    replicate(&b, &a, &key_b);
    a.update("default").unwrap();

    a.remove_writer("default", key_b, RemoveOptions::freeze())
        .unwrap();
    assert_eq!(
        a.get_keys("default").unwrap().writers,
        vec![(key_b, MemberState::Frozen { length: 1 })]
    );

    b.append("default", &set("late", "2")).unwrap();
    b.append("default", &del("early")).unwrap();
    replicate(&b, &a, &key_b);
    a.update("default").unwrap();

    assert_eq!(a.text("early").as_deref(), Some("1"));
    assert_eq!(a.text("late"), None);

    a.rebuild("default").unwrap();
    assert_eq!(a.text("early").as_deref(), Some("1"));
    assert_eq!(a.text("late"), None);
}

#[tokio::test]
async fn test_destroyed_writer_cannot_come_back() {
    let a = TestStore::new("destroy", false).await;
    let b = TestStore::new("destroy", false).await;
    let key_b = b.writer_key();
    let mut events = a.subscribe();

    a.add_writer("default", key_b, AddOptions::default()).unwrap();
    a.remove_writer("default", key_b, RemoveOptions::destroy())
        .unwrap();
    a.add_writer("default", key_b, AddOptions::default()).unwrap();

    let mut rejected = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StoreEvent::TopologyRejected { key, .. } if key == key_b) {
            rejected = true;
        }
    }
    assert!(rejected);
    assert_eq!(
        a.get_keys("default").unwrap().writers,
        vec![(key_b, MemberState::Destroyed)]
    );
}

#[tokio::test]
async fn test_topology_survives_reopen() {
    let a = TestStore::new("reopen", false).await;
    let b = TestStore::new("reopen", false).await;
    let key_b = b.writer_key();

    b.append("default", &set("k", "from b")).unwrap();
    a.add_writer("default", key_b, AddOptions::default()).unwrap();
    replicate(&b, &a, &key_b);
    a.update("default").unwrap();

    let TestStore { store, dir: tmp } = a;
    let dir = tmp.path().to_path_buf();
    let config = store.config().clone();
    store.close().await.unwrap();
    drop(store);

    let reopened = braidstore_core::Store::open(config, common::protocols())
        .await
        .unwrap();
    assert_eq!(reopened.data_dir(), dir.as_path());
    assert_eq!(
        reopened.get_keys("default").unwrap().writers,
        vec![(key_b, MemberState::Active)]
    );
    assert_eq!(
        reopened.get("default", "k").unwrap().and_then(|v| v.as_text().map(str::to_string)),
        Some("from b".to_string())
    );
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_query_range_and_stream() {
    let a = TestStore::new("query", false).await;
    for i in 0..250 {
        a.append("default", &set(&format!("item/{:03}", i), "x"))
            .unwrap();
    }
    a.append("default", &set("other", "y")).unwrap();

    let capped = a.query("default", &RangeOptions::prefix("item/")).unwrap();
    assert_eq!(capped.len(), 100);
    assert_eq!(capped[0].0, "item/000");

    let reversed = a
        .query(
            "default",
            &RangeOptions::prefix("item/").reversed().with_limit(3),
        )
        .unwrap();
    let keys: Vec<&str> = reversed.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["item/249", "item/248", "item/247"]);

    let streamed: Vec<String> = a
        .query_stream("default", RangeOptions::prefix("item/"))
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(streamed.len(), 250);
    assert!(streamed.windows(2).all(|w| w[0] < w[1]));
}

// ============================================================================
// Determinism
// ============================================================================

/// Ops appended by one of two writers, after optionally syncing with the other
#[derive(Debug, Clone)]
struct Step {
    writer: usize,
    sync_first: bool,
    key: u8,
    delete: bool,
}

fn steps_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (0..2usize, any::<bool>(), 0..6u8, prop::bool::weighted(0.2)).prop_map(
            |(writer, sync_first, key, delete)| Step {
                writer,
                sync_first,
                key,
                delete,
            },
        ),
        1..24,
    )
}

async fn run_steps(steps: Vec<Step>) -> (Vec<(String, String)>, Vec<(String, String)>, Vec<(String, String)>) {
    let writers = [
        TestStore::new("det", false).await,
        TestStore::new("det", false).await,
    ];
    let keys = [writers[0].writer_key(), writers[1].writer_key()];
    writers[0]
        .add_writer("default", keys[1], AddOptions::default())
        .unwrap();
    writers[1]
        .add_writer("default", keys[0], AddOptions::default())
        .unwrap();

    for (i, step) in steps.iter().enumerate() {
        let me = &writers[step.writer];
        let other = 1 - step.writer;
        if step.sync_first {
            replicate(&writers[other], me, &keys[other]);
            me.update("default").unwrap();
        }
        let key = format!("k{}", step.key);
        let op = if step.delete {
            del(&key)
        } else {
            set(&key, &format!("{}:{}", step.writer, i))
        };
        me.append("default", &op).unwrap();
    }

    let observer = TestStore::new("det", false).await;
    for (writer, key) in writers.iter().zip(keys) {
        observer
            .add_writer("default", key, AddOptions::default())
            .unwrap();
        replicate(writer, &observer, &key);
    }

    let dump = |store: &TestStore| -> Vec<(String, String)> {
        store
            .query("default", &RangeOptions::all().with_limit(usize::MAX))
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k, v.as_text().unwrap_or_default().to_string()))
            .collect()
    };

    observer.update("default").unwrap();
    let incremental = dump(&observer);
    observer.rebuild("default").unwrap();
    let first = dump(&observer);
    observer.rebuild("default").unwrap();
    let second = dump(&observer);
    (incremental, first, second)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Replaying the same logs from empty always yields the same index
    #[test]
    fn replay_is_deterministic(steps in steps_strategy()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (incremental, first, second) = runtime.block_on(run_steps(steps));
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&incremental, &first);
    }
}
