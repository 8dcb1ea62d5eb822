//! End-to-end store scenarios on a single node: writes, a snapshot taken to
//! disk, later writes, and a restore that rolls the map back.

use std::sync::Arc;

use tempfile::TempDir;

use replicated_kv::engine::{ClusterMember, Configuration, ConsensusEngine};
use replicated_kv::fsm::KvFsm;
use replicated_kv::membership::JoinOutcome;
use replicated_kv::snapshot_store::FileSnapshotStore;
use replicated_kv::store::Store;
use replicated_kv::test_utils::{EngineCall, MockEngine};

fn bootstrapped(node_id: &str, address: &str) -> (Arc<KvFsm>, Store<Arc<MockEngine>>) {
    let fsm = Arc::new(KvFsm::new());
    let engine = Arc::new(MockEngine::with_fsm(Arc::clone(&fsm)));
    engine
        .bootstrap_cluster(Configuration::single(ClusterMember::new(node_id, address)))
        .unwrap();
    (Arc::clone(&fsm), Store::new(node_id, fsm, engine))
}

#[test]
fn restore_from_disk_rolls_back_later_writes() {
    let dir = TempDir::new().unwrap();
    let snapshots = FileSnapshotStore::open(dir.path(), 2).unwrap();
    let (fsm, store) = bootstrapped("n1", "127.0.0.1:12000");

    store.set("a", "1").unwrap();
    store.set("b", "2").unwrap();

    let configuration = store.engine().configuration().unwrap();
    let sink = snapshots.create(2, 1, vec![1], configuration).unwrap();
    fsm.snapshot().persist(sink).unwrap();

    store.set("a", "3").unwrap();
    assert_eq!(store.get("a").unwrap().as_deref(), Some("3"));

    let (meta, file) = snapshots.open_latest().unwrap().expect("snapshot on disk");
    assert_eq!(meta.index, 2);
    fsm.restore(file).unwrap();

    assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
    assert_eq!(store.status().unwrap().keys, 2);
}

#[test]
fn restore_replaces_rather_than_merges() {
    let (fsm, store) = bootstrapped("n1", "127.0.0.1:12000");
    store.set("a", "1").unwrap();
    let image = fsm.snapshot();

    store.set("z", "26").unwrap();
    let bytes = serde_json::to_vec(image.entries()).unwrap();
    fsm.restore(bytes.as_slice()).unwrap();

    assert_eq!(store.get("z").unwrap(), None);
    assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
}

#[test]
fn corrupt_snapshot_leaves_state_untouched() {
    let (fsm, store) = bootstrapped("n1", "127.0.0.1:12000");
    store.set("a", "1").unwrap();

    assert!(fsm.restore(&b"{not json"[..]).is_err());

    assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
}

#[test]
fn rejoin_under_new_address_replaces_stale_member() {
    let (_, store) = bootstrapped("n0", "10.0.0.0:9000");
    store.join("n1", "10.0.0.1:9000").unwrap();
    let before = store.engine().calls().len();

    let outcome = store.join("n1", "10.0.0.2:9000").unwrap();

    assert_eq!(
        outcome,
        JoinOutcome::Added {
            removed: vec![ClusterMember::new("n1", "10.0.0.1:9000")],
        }
    );
    assert_eq!(
        store.engine().calls()[before..],
        [
            EngineCall::RemoveServer { id: "n1".into() },
            EngineCall::AddVoter {
                id: "n1".into(),
                address: "10.0.0.2:9000".into(),
            },
        ]
    );
    let members = store.engine().configuration().unwrap().members;
    assert_eq!(
        members,
        vec![
            ClusterMember::new("n0", "10.0.0.0:9000"),
            ClusterMember::new("n1", "10.0.0.2:9000"),
        ]
    );
}

#[test]
fn new_id_on_reused_address_evicts_old_owner() {
    let (_, store) = bootstrapped("n0", "10.0.0.0:9000");
    store.join("n1", "10.0.0.1:9000").unwrap();

    let outcome = store.join("n9", "10.0.0.1:9000").unwrap();

    assert_eq!(
        outcome,
        JoinOutcome::Added {
            removed: vec![ClusterMember::new("n1", "10.0.0.1:9000")],
        }
    );
    let ids: Vec<_> = store
        .engine()
        .configuration()
        .unwrap()
        .members
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, ["n0", "n9"]);
}
