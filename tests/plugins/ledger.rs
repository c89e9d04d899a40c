use sightline::core::config::EngineConfig;
use sightline::core::error::SightlineError;
use sightline::core::lock::SessionLock;
use sightline::core::storage::{PendingRecord, SegmentIndex, SegmentLog};
use sightline::core::store::Store;
use sightline::plugins::boundary::BoundaryMap;
use sightline::plugins::ledger::{ExportFacts, ImportFacts, Ledger, Payload};
use sightline::plugins::session::{SessionEvent, SessionScope, SessionState};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

struct Fixture {
    _tmp: TempDir,
    target: PathBuf,
    store: Store,
}

fn fixture() -> Fixture {
    let tmp = tempdir().expect("tempdir");
    let target = tmp.path().join("repo");
    fs::create_dir_all(target.join("src")).unwrap();
    fs::write(target.join("src/a.rs"), "fn a() {}\n").unwrap();
    fs::write(target.join("src/b.rs"), "fn b() {}\nfn c() {}\n").unwrap();
    let store = Store::open(&tmp.path().join("state")).unwrap();
    Fixture {
        _tmp: tmp,
        target,
        store,
    }
}

fn new_session(ledger: &Ledger, target: &Path) -> String {
    ledger
        .sessions()
        .create(SessionScope::Module, "audit imports", target, &BoundaryMap::default())
        .unwrap()
        .id
}

fn import(target: &str) -> Payload {
    Payload::Import(ImportFacts {
        target: target.to_string(),
        line: Some(1),
        statement: None,
    })
}

#[test]
fn appended_observations_read_back_with_verified_hashes() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);

    let mut writer = ledger.writer(&id).unwrap();
    let first = writer.append_file(Path::new("src/a.rs")).unwrap();
    let second = writer.append("src/a.rs", import("src/b.rs")).unwrap();
    assert_eq!(writer.finish().unwrap(), 2);

    assert_eq!(first.subject, "src/a.rs");
    assert!(!first.limitations.is_empty());

    let read: Vec<_> = ledger
        .read(&id)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(read, vec![first, second]);

    let session = ledger.sessions().get(&id).unwrap();
    assert_eq!(session.state, SessionState::Running);
    assert_eq!(session.observation_ids.len(), 2);
}

#[test]
fn reader_is_restartable_over_the_same_snapshot() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    ledger.append(&id, "src/a.rs", import("src/b.rs")).unwrap();

    let mut reader = ledger.read(&id).unwrap();
    ledger.append(&id, "src/b.rs", import("src/a.rs")).unwrap();

    assert_eq!(reader.len(), 1);
    let first_pass: Vec<_> = (&mut reader).map(|r| r.unwrap().id).collect();
    reader.rewind();
    let second_pass: Vec<_> = (&mut reader).map(|r| r.unwrap().id).collect();
    assert_eq!(first_pass, second_pass);
    assert_eq!(ledger.read(&id).unwrap().len(), 2);
}

#[test]
fn tampered_record_is_reported_and_scan_continues() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    let mut writer = ledger.writer(&id).unwrap();
    writer.append("src/a.rs", import("lib/one.rs")).unwrap();
    let victim = writer.append("src/b.rs", import("lib/two.rs")).unwrap();
    writer.append("src/a.rs", import("lib/six.rs")).unwrap();
    writer.finish().unwrap();

    let log_path = fx.store.segment(&id).log();
    let mut bytes = fs::read(&log_path).unwrap();
    let needle = b"lib/two.rs";
    let pos = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("payload present in log");
    bytes[pos..pos + needle.len()].copy_from_slice(b"lib/ten.rs");
    fs::write(&log_path, &bytes).unwrap();

    let report = ledger.verify_integrity(&id).unwrap();
    assert!(report.is_corrupt);
    assert_eq!(report.records_checked, 3);
    assert_eq!(report.corruption_count, 1);
    assert_eq!(report.evidence[0].record_id, victim.id);
    assert!(report.evidence[0].reason.contains("hash"));

    let again = ledger.verify_integrity(&id).unwrap();
    assert_eq!(report, again);

    let results: Vec<_> = ledger.read(&id).unwrap().collect();
    assert_eq!(results.len(), 3);
    assert!(matches!(results[1], Err(SightlineError::CorruptionError { .. })));
    assert!(results[0].is_ok() && results[2].is_ok());
}

#[test]
fn terminal_session_rejects_appends() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    ledger.append(&id, "src/a.rs", import("src/b.rs")).unwrap();
    ledger
        .sessions()
        .advance(&id, SessionEvent::Complete, "done-1")
        .unwrap();

    let err = ledger.append(&id, "src/a.rs", import("src/b.rs")).unwrap_err();
    assert!(matches!(err, SightlineError::ValidationError { .. }));
    assert_eq!(ledger.read(&id).unwrap().len(), 1);
}

#[test]
fn buffered_records_are_refused_once_session_is_terminal() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);

    let mut writer = ledger.writer(&id).unwrap();
    writer.append("src/a.rs", import("src/b.rs")).unwrap();
    ledger
        .sessions()
        .advance(&id, SessionEvent::Cancel, "stop")
        .unwrap();
    assert!(matches!(
        writer.flush(),
        Err(SightlineError::ValidationError { .. })
    ));
    assert_eq!(writer.pending(), 0);
    drop(writer);
    assert!(ledger.read(&id).unwrap().is_empty());
}

#[test]
fn subjects_outside_the_root_are_rejected() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);

    for subject in ["../outside.rs", "/etc/passwd", "src/../../x.rs"] {
        let err = ledger.append(&id, subject, import("src/a.rs")).unwrap_err();
        assert!(
            matches!(err, SightlineError::ValidationError { .. }),
            "{subject} should be rejected"
        );
    }
    assert!(ledger.read(&id).unwrap().is_empty());
}

#[test]
fn empty_required_field_is_rejected() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    let err = ledger
        .append(
            &id,
            "src/a.rs",
            Payload::Export(ExportFacts {
                symbol: "  ".to_string(),
                line: None,
            }),
        )
        .unwrap_err();
    assert!(matches!(err, SightlineError::ValidationError { .. }));
}

#[test]
fn records_larger_than_one_frame_span_several() {
    let fx = fixture();
    let mut config = EngineConfig::default();
    config.ledger.max_frame_bytes = 64;
    let ledger = Ledger::new(&fx.store, &config);
    let id = new_session(&ledger, &fx.target);

    let statement = "use ".to_string() + &"very::long::path::".repeat(200);
    let payload = Payload::Import(ImportFacts {
        target: "src/b.rs".to_string(),
        line: Some(3),
        statement: Some(statement),
    });
    let written = ledger.append(&id, "src/a.rs", payload).unwrap();

    let log_len = fs::metadata(fx.store.segment(&id).log()).unwrap().len();
    assert!(log_len > 64 * 10);
    let read: Vec<_> = ledger.read(&id).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(read, vec![written]);
    assert!(!ledger.verify_integrity(&id).unwrap().is_corrupt);
}

#[test]
fn flush_threshold_commits_without_finish() {
    let fx = fixture();
    let mut config = EngineConfig::default();
    config.ledger.flush_threshold = 2;
    let ledger = Ledger::new(&fx.store, &config);
    let id = new_session(&ledger, &fx.target);

    let mut writer = ledger.writer(&id).unwrap();
    writer.append("src/a.rs", import("x/1.rs")).unwrap();
    assert_eq!(writer.pending(), 1);
    writer.append("src/a.rs", import("x/2.rs")).unwrap();
    assert_eq!(writer.pending(), 0);
    assert_eq!(ledger.read(&id).unwrap().len(), 2);
    writer.append("src/a.rs", import("x/3.rs")).unwrap();
    assert_eq!(ledger.read(&id).unwrap().len(), 2);
    writer.finish().unwrap();
    assert_eq!(ledger.read(&id).unwrap().len(), 3);
}

#[test]
fn second_writer_is_refused_while_first_is_live() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);

    let writer = ledger.writer(&id).unwrap();
    match ledger.writer(&id) {
        Err(SightlineError::LockContention { owner_pid, .. }) => {
            assert_eq!(owner_pid, std::process::id());
        }
        other => panic!("expected contention, got {:?}", other.map(|w| w.session_id().to_string())),
    }
    drop(writer);
    assert!(!fx.store.segment(&id).lock().exists());
    ledger.writer(&id).unwrap().finish().unwrap();
}

#[test]
fn stale_lock_of_a_dead_process_is_reclaimed() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    let lock_path = fx.store.segment(&id).lock();
    fs::write(
        &lock_path,
        serde_json::json!({
            "pid": 3_999_999_999u32,
            "owner": "crashed-writer",
            "session_id": id,
            "heartbeat_ms": 0,
        })
        .to_string(),
    )
    .unwrap();

    let lock = SessionLock::acquire(&lock_path, &id, Duration::from_secs(30)).unwrap();
    assert_eq!(lock.record().pid, std::process::id());
}

#[test]
fn live_writer_with_an_old_heartbeat_is_not_reclaimed() {
    let fx = fixture();
    let mut config = EngineConfig::default();
    config.lock.stale_after_secs = 1;
    let ledger = Ledger::new(&fx.store, &config);
    let id = new_session(&ledger, &fx.target);
    let lock_path = fx.store.segment(&id).lock();

    let mut slow = ledger.writer(&id).unwrap();
    slow.append("src/a.rs", import("src/b.rs")).unwrap();
    slow.flush().unwrap();

    // Age the heartbeat well past the stale window while the owner stays alive.
    let mut held: serde_json::Value = serde_json::from_slice(&fs::read(&lock_path).unwrap()).unwrap();
    held["heartbeat_ms"] = serde_json::json!(1);
    fs::write(&lock_path, held.to_string()).unwrap();

    match ledger.writer(&id) {
        Err(SightlineError::LockContention { owner_pid, .. }) => {
            assert_eq!(owner_pid, std::process::id());
        }
        other => panic!("expected contention, got {:?}", other.map(|w| w.session_id().to_string())),
    }

    slow.append("src/b.rs", import("src/a.rs")).unwrap();
    assert_eq!(slow.finish().unwrap(), 2);
    assert_eq!(ledger.read(&id).unwrap().len(), 2);
}

#[test]
fn writer_that_lost_its_lock_commits_nothing() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    let lock_path = fx.store.segment(&id).lock();

    let mut writer = ledger.writer(&id).unwrap();
    writer.append("src/a.rs", import("src/b.rs")).unwrap();
    writer.flush().unwrap();
    writer.append("src/a.rs", import("src/c.rs")).unwrap();

    let mut usurper: serde_json::Value = serde_json::from_slice(&fs::read(&lock_path).unwrap()).unwrap();
    usurper["owner"] = serde_json::json!("other-writer");
    fs::write(&lock_path, usurper.to_string()).unwrap();

    assert!(matches!(
        writer.flush(),
        Err(SightlineError::LockContention { .. })
    ));
    let committed = SegmentIndex::load(&fx.store.segment(&id)).unwrap();
    assert_eq!(committed.entries.len(), 1);
    let log_len = fs::metadata(fx.store.segment(&id).log()).unwrap().len();
    assert_eq!(log_len, committed.committed_len);
    writer.abandon();
}

#[test]
fn staged_but_unpublished_records_vanish_after_crash() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    ledger.append(&id, "src/a.rs", import("src/b.rs")).unwrap();
    let paths = fx.store.segment(&id);
    let committed = SegmentIndex::load(&paths).unwrap().committed_len;

    {
        let mut log = SegmentLog::open(&paths, 1024).unwrap();
        let staged = log
            .stage(&[PendingRecord {
                id: "01UNPUBLISHED".to_string(),
                hash: "0".repeat(64),
                body: b"{\"never\":\"visible\"}".to_vec(),
            }])
            .unwrap();
        // Simulated crash between fsync and index publish.
        drop(staged);
    }
    assert!(fs::metadata(paths.log()).unwrap().len() > committed);
    assert_eq!(ledger.read(&id).unwrap().len(), 1);

    ledger.append(&id, "src/b.rs", import("src/a.rs")).unwrap();
    let ids: Vec<_> = ledger.read(&id).unwrap().map(|r| r.unwrap().subject).collect();
    assert_eq!(ids, vec!["src/a.rs".to_string(), "src/b.rs".to_string()]);
    assert!(!ledger.verify_integrity(&id).unwrap().is_corrupt);
}

#[test]
fn torn_tail_is_truncated_on_next_open() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    ledger.append(&id, "src/a.rs", import("src/b.rs")).unwrap();
    let paths = fx.store.segment(&id);
    let committed = SegmentIndex::load(&paths).unwrap().committed_len;

    let mut log = OpenOptions::new().append(true).open(paths.log()).unwrap();
    log.write_all(&[0xff, 0x00, 0x00]).unwrap();
    drop(log);

    let reopened = SegmentLog::open(&paths, 1024).unwrap();
    assert_eq!(reopened.index().committed_len, committed);
    assert_eq!(fs::metadata(paths.log()).unwrap().len(), committed);
}

#[test]
fn log_shorter_than_index_is_corruption() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    let id = new_session(&ledger, &fx.target);
    ledger.append(&id, "src/a.rs", import("src/b.rs")).unwrap();
    let paths = fx.store.segment(&id);
    let committed = SegmentIndex::load(&paths).unwrap().committed_len;

    let log = OpenOptions::new().write(true).open(paths.log()).unwrap();
    log.set_len(committed - 5).unwrap();
    drop(log);

    assert!(matches!(
        SegmentLog::open(&paths, 1024),
        Err(SightlineError::CorruptionError { .. })
    ));
}

#[test]
fn unknown_session_is_not_found() {
    let fx = fixture();
    let ledger = Ledger::new(&fx.store, &EngineConfig::default());
    assert!(matches!(
        ledger.read("01NOSUCHSESSION"),
        Err(SightlineError::NotFound { .. })
    ));
    assert!(matches!(
        ledger.verify_integrity("01NOSUCHSESSION"),
        Err(SightlineError::NotFound { .. })
    ));
}
