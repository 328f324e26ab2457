//! Integration tests for trayvault.
//!
//! These tests run trays, cords, locks, and the registry against a real
//! directory tree. Every test builds its own store in a temporary directory,
//! and separate `LockingStore`s over the same directory stand in for
//! separate processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use trayvault::lock::LockIdentity;
use trayvault::storage::local::LocalFileStore;
use trayvault::{
    CordKind, Documents, FieldValue, LockingStore, Object, ObjectStore, StoragePath, TrayKind, open_cord,
    open_tray,
};

/// Test helper owning a local store in a temporary directory.
struct TestStore {
    _temp_dir: TempDir,
    store: Arc<LocalFileStore>,
}

impl TestStore {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalFileStore::new(temp_dir.path()).expect("Failed to open store");
        store.make_container("data").expect("Failed to create container");
        Self {
            _temp_dir: temp_dir,
            store: Arc::new(store),
        }
    }

    /// A lock-protected view of the store, as one process would hold it.
    fn process(&self, host: &str) -> Arc<LockingStore> {
        Arc::new(
            LockingStore::new(Arc::clone(&self.store) as Arc<dyn ObjectStore>)
                .with_identity(LockIdentity::new(host, "127.0.0.1"))
                .with_poll_interval(Duration::from_millis(2)),
        )
    }
}

fn path(p: &str) -> StoragePath {
    StoragePath::new("data", p)
}

fn obj(value: Value) -> Object {
    match value {
        Value::Object(object) => object,
        _ => panic!("not an object"),
    }
}

// =============================================================================
// Trays
// =============================================================================

mod tray_tests {
    use super::*;

    #[test]
    fn round_trip_across_close_and_reopen() {
        let env = TestStore::new();
        let values = [
            json!("text"),
            json!(42),
            json!(1.5),
            json!(null),
            json!([1, "two", {"three": 3}]),
            json!({"nested": {"deep": [true, false]}}),
            json!("line\nbreak and \"quotes\""),
        ];

        for kind in [TrayKind::Persistent, TrayKind::Volatile, TrayKind::Immutable] {
            let p = path(&format!("/round/{kind}.json"));
            let tray = open_tray(env.process("a"), p.clone(), kind).unwrap();
            for (i, value) in values.iter().enumerate() {
                tray.put(&format!("k{i}"), value.clone()).unwrap();
            }
            tray.close().unwrap();
            drop(tray);

            let reopened = open_tray(env.process("b"), p, kind).unwrap();
            for (i, value) in values.iter().enumerate() {
                assert_eq!(reopened.get(&format!("k{i}")).unwrap().as_ref(), Some(value), "{kind}");
            }
        }
    }

    #[test]
    fn independent_instance_sees_committed_change() {
        let env = TestStore::new();
        let p = path("/shared.json");
        let a = open_tray(env.process("a"), p.clone(), TrayKind::Persistent).unwrap();
        let b = open_tray(env.process("b"), p.clone(), TrayKind::Persistent).unwrap();
        assert_eq!(b.get("plan").unwrap(), None);

        a.put("plan", json!("free")).unwrap();
        assert_eq!(b.get("plan").unwrap(), Some(json!("free")));

        a.put("plan", json!("enterprise")).unwrap();
        assert_eq!(b.get("plan").unwrap(), Some(json!("enterprise")));
    }

    #[test]
    fn write_through_survives_crash() {
        let env = TestStore::new();
        let p = path("/durable.json");
        let tray = open_tray(env.process("a"), p.clone(), TrayKind::Persistent).unwrap();
        tray.put("k", json!("before")).unwrap();
        tray.put("k", json!("after")).unwrap();
        std::mem::forget(tray);

        let recovered = open_tray(env.process("b"), p, TrayKind::Persistent).unwrap();
        assert_eq!(recovered.get("k").unwrap(), Some(json!("after")));
    }

    #[test]
    fn buffered_changes_lost_on_crash() {
        let env = TestStore::new();
        let p = path("/buffered.json");
        let tray = open_tray(env.process("a"), p.clone(), TrayKind::Volatile).unwrap();
        tray.put("k", json!("before")).unwrap();
        tray.commit().unwrap();
        tray.put("k", json!("after")).unwrap();
        std::mem::forget(tray);

        let recovered = open_tray(env.process("b"), p, TrayKind::Volatile).unwrap();
        assert_eq!(recovered.get("k").unwrap(), Some(json!("before")));
    }

    #[test]
    fn immutable_tombstone_survives_external_readd() {
        let env = TestStore::new();
        let p = path("/ids.json");
        let tray = open_tray(env.process("a"), p.clone(), TrayKind::Immutable).unwrap();
        tray.put("session-1", json!({"user": "u1"})).unwrap();
        tray.remove("session-1").unwrap();

        let other = open_tray(env.process("b"), p, TrayKind::Persistent).unwrap();
        other.put("session-1", json!({"user": "intruder"})).unwrap();

        assert_eq!(tray.get("session-1").unwrap(), None);
        assert!(tray.keys().unwrap().is_empty());
        assert_eq!(other.get("session-1").unwrap(), Some(json!({"user": "intruder"})));
    }

    #[test]
    fn construction_creates_backing_object() {
        let env = TestStore::new();
        let p = path("/fresh/new.json");
        assert!(!env.store.exists(&p).unwrap());

        let tray = open_tray(env.process("a"), p.clone(), TrayKind::Volatile).unwrap();
        assert!(env.store.exists(&p).unwrap());
        assert!(tray.is_empty().unwrap());
    }

    #[test]
    fn tolerates_hand_appended_property() {
        let env = TestStore::new();
        let p = path("/edited.json");
        let tray = open_tray(env.process("a"), p.clone(), TrayKind::Persistent).unwrap();
        tray.put("plan", json!("free")).unwrap();
        tray.put("name", json!("Ada")).unwrap();

        let mut text = env.store.read_all(&p).unwrap();
        text.truncate(text.len() - 1);
        text.extend_from_slice(b"\"plan\":\"pro\"\n}");
        env.store.write(&p, &text).unwrap();

        assert_eq!(tray.get("plan").unwrap(), Some(json!("pro")));
        assert_eq!(tray.count().unwrap(), 2);
    }

    #[test]
    fn concurrent_puts_on_shared_instance() {
        let env = TestStore::new();
        let tray = open_tray(env.process("a"), path("/counter.json"), TrayKind::Persistent).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tray = Arc::clone(&tray);
                thread::spawn(move || {
                    for i in 0..5 {
                        tray.put(&format!("t{t}-{i}"), json!(i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tray.count().unwrap(), 20);
    }
}

// =============================================================================
// Cords
// =============================================================================

mod cord_tests {
    use super::*;

    #[test]
    fn remove_all_where_returns_matches_in_order() {
        let env = TestStore::new();
        let cord = open_cord(env.process("a"), path("/logs/today.json"), CordKind::Persistent).unwrap();
        for (user, event) in [("42", "login"), ("7", "login"), ("42", "search"), ("42", "logout"), ("9", "x")] {
            cord.append(obj(json!({"user_id": user, "event": event}))).unwrap();
        }

        let removed = cord.remove_all_where("user_id", &FieldValue::from("42")).unwrap();
        let events: Vec<&str> = removed.iter().filter_map(|o| o["event"].as_str()).collect();
        assert_eq!(events, vec!["login", "search", "logout"]);
        assert_eq!(cord.size().unwrap(), 2);

        assert!(cord.remove_all_where("user_id", &FieldValue::from("42")).unwrap().is_empty());
        assert_eq!(cord.size().unwrap(), 2);
    }

    #[test]
    fn integer_predicates_do_not_match_strings() {
        let env = TestStore::new();
        let cord = open_cord(env.process("a"), path("/logs/mixed.json"), CordKind::Persistent).unwrap();
        cord.append(obj(json!({"user_id": 42}))).unwrap();
        cord.append(obj(json!({"user_id": "42"}))).unwrap();

        assert_eq!(cord.get_all_where("user_id", &FieldValue::Int(42)).unwrap().len(), 1);
        assert_eq!(cord.get_all_where("user_id", &FieldValue::from("42")).unwrap().len(), 1);
    }

    #[test]
    fn volatile_cord_flushes_on_close() {
        let env = TestStore::new();
        let p = path("/logs/buffered.json");
        let cord = open_cord(env.process("a"), p.clone(), CordKind::Volatile).unwrap();
        cord.append(obj(json!({"n": 1}))).unwrap();
        cord.append(obj(json!({"n": 2}))).unwrap();

        let reader = open_cord(env.process("b"), p.clone(), CordKind::Persistent).unwrap();
        assert_eq!(reader.size().unwrap(), 0);

        cord.close().unwrap();
        assert_eq!(reader.size().unwrap(), 2);
        assert_eq!(reader.get_last().unwrap(), Some(obj(json!({"n": 2}))));
    }

    #[test]
    fn reads_compact_json_written_elsewhere() {
        let env = TestStore::new();
        let p = path("/logs/imported.json");
        env.store.write(&p, br#"[{"a":1},{"a":2}]"#).unwrap();

        let cord = open_cord(env.process("a"), p, CordKind::Persistent).unwrap();
        assert_eq!(cord.get_one_where("a", &FieldValue::Int(2)).unwrap(), Some(obj(json!({"a": 2}))));
    }
}

// =============================================================================
// Locks
// =============================================================================

mod lock_tests {
    use super::*;

    #[test]
    fn writers_never_overlap() {
        let env = TestStore::new();
        let p = path("/contended.json");
        let inside = Arc::new(AtomicBool::new(false));
        let writes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let locking = env.process(&format!("host-{t}"));
                let p = p.clone();
                let inside = Arc::clone(&inside);
                let writes = Arc::clone(&writes);
                thread::spawn(move || {
                    for i in 0..5 {
                        locking
                            .locked(&p, Duration::from_secs(30), |store| {
                                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                                store.write(&p, format!("{t}-{i}").as_bytes())?;
                                thread::sleep(Duration::from_millis(1));
                                inside.store(false, Ordering::SeqCst);
                                writes.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(writes.load(Ordering::SeqCst), 20);
        assert!(!env.process("check").is_locked(&p).unwrap());
    }

    #[test]
    fn stuck_lock_delays_then_is_broken() {
        let env = TestStore::new();
        let p = path("/stuck.json");
        // Sentinel left behind by a holder that crashed.
        env.store
            .write(
                &LockingStore::lock_path(&p).unwrap(),
                br#"{"host":"crashed","ip":"10.0.0.1","time":0}"#,
            )
            .unwrap();

        let survivor = env.process("survivor");
        assert_eq!(survivor.locked_by_host(&p).unwrap().as_deref(), Some("crashed"));
        let err = survivor.write(&p, b"{}", Duration::from_millis(20)).unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(!env.store.exists(&p).unwrap());

        survivor.write_forced(&p, b"{}", Duration::from_millis(20)).unwrap();
        assert!(!survivor.is_locked(&p).unwrap());
        assert_eq!(env.store.read_all(&p).unwrap(), b"{}");
    }

    #[test]
    fn holder_is_recorded() {
        let env = TestStore::new();
        let p = path("/held.json");
        let holder = env.process("worker-7");
        let observer = env.process("observer");

        holder
            .locked(&p, Duration::ZERO, |_| {
                assert_eq!(observer.locked_by_host(&p).unwrap().as_deref(), Some("worker-7"));
                assert_eq!(observer.locked_by_ip(&p).unwrap().as_deref(), Some("127.0.0.1"));
                assert!(observer.locked_by_time(&p).unwrap().is_some());
                Ok(())
            })
            .unwrap();
        assert_eq!(observer.lock_holder(&p).unwrap(), None);
    }

    #[test]
    fn tray_waits_for_other_holder() {
        let env = TestStore::new();
        let p = path("/waiting.json");
        let tray = open_tray(env.process("a"), p.clone(), TrayKind::Persistent).unwrap();
        let other = env.process("b");

        let writer = {
            let tray = Arc::clone(&tray);
            thread::spawn(move || tray.put("k", json!("v")).unwrap())
        };
        other
            .locked(&p, Duration::from_secs(5), |_| {
                thread::sleep(Duration::from_millis(30));
                Ok(())
            })
            .unwrap();
        writer.join().unwrap();

        assert_eq!(tray.get("k").unwrap(), Some(json!("v")));
    }
}

// =============================================================================
// Registry
// =============================================================================

mod registry_tests {
    use super::*;

    #[test]
    fn buffered_changes_are_shared_through_registry() {
        let env = TestStore::new();
        let docs = Documents::new(env.process("a"));
        let p = path("/session.json");

        let a = docs.tray(&p, TrayKind::Volatile).unwrap();
        let b = docs.tray(&p, TrayKind::Volatile).unwrap();
        a.put("token", json!("abc")).unwrap();
        assert_eq!(b.get("token").unwrap(), Some(json!("abc")));
        b.commit().unwrap();

        let outside = open_tray(env.process("b"), p, TrayKind::Persistent).unwrap();
        assert_eq!(outside.get("token").unwrap(), Some(json!("abc")));
    }

    #[test]
    fn kind_conflict_is_reported() {
        let env = TestStore::new();
        let docs = Documents::new(env.process("a"));
        let p = path("/log.json");
        let _cord = docs.cord(&p, CordKind::Persistent).unwrap();

        let err = docs.tray(&p, TrayKind::Persistent).err().unwrap();
        assert!(err.to_string().contains("persistent cord"));
    }
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[test]
fn profile_scenario() {
    let env = TestStore::new();
    let p = StoragePath::new("data", "/acct/u1/profile.json");

    let tray = open_tray(env.process("a"), p.clone(), TrayKind::Persistent).unwrap();
    tray.put("email", json!("a@b.com")).unwrap();
    tray.close().unwrap();
    drop(tray);

    let tray = open_tray(env.process("a"), p.clone(), TrayKind::Persistent).unwrap();
    assert_eq!(tray.get("email").unwrap(), Some(json!("a@b.com")));
    tray.remove("email").unwrap();
    assert_eq!(tray.get("email").unwrap(), None);
    assert_eq!(tray.count().unwrap(), 0);

    let listed: Vec<String> = env
        .store
        .list(&StoragePath::new("data", "/acct"))
        .unwrap()
        .into_iter()
        .map(|m| m.path.path().to_string())
        .collect();
    assert_eq!(listed, vec!["/acct/u1/profile.json"]);
}
