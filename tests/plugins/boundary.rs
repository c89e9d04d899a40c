use sightline::core::config::EngineConfig;
use sightline::core::severity::Severity;
use sightline::core::store::Store;
use sightline::plugins::boundary::{self, BoundaryMap, LayerRule};
use sightline::plugins::ledger::{ImportFacts, Ledger, Payload};
use sightline::plugins::session::SessionScope;
use std::fs;
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};

fn layered_repo() -> (TempDir, PathBuf, Store) {
    let tmp = tempdir().expect("tempdir");
    let target = tmp.path().join("repo");
    for dir in ["core", "bridge", "util", "docs"] {
        fs::create_dir_all(target.join(dir)).unwrap();
    }
    fs::write(target.join("core/engine.rs"), "mod engine;\n").unwrap();
    fs::write(target.join("core/model.rs"), "mod model;\n").unwrap();
    fs::write(target.join("bridge/cli.rs"), "mod cli;\n").unwrap();
    fs::write(target.join("util/fmt.rs"), "mod fmt;\n").unwrap();
    let store = Store::open(&tmp.path().join("state")).unwrap();
    (tmp, target, store)
}

fn policy() -> BoundaryMap {
    BoundaryMap::new(vec![
        LayerRule {
            name: "core".to_string(),
            pattern: "core/**".to_string(),
            allowed_targets: vec!["util".to_string()],
            severity: Severity::High,
        },
        LayerRule {
            name: "bridge".to_string(),
            pattern: "bridge/**".to_string(),
            allowed_targets: vec!["core".to_string(), "util".to_string()],
            severity: Severity::Medium,
        },
        LayerRule {
            name: "util".to_string(),
            pattern: "util/**".to_string(),
            allowed_targets: vec![],
            severity: Severity::Low,
        },
    ])
}

fn import(target: &str) -> Payload {
    Payload::Import(ImportFacts {
        target: target.to_string(),
        line: Some(1),
        statement: Some(format!("use {target};")),
    })
}

#[test]
fn core_importing_bridge_is_the_only_violation() {
    let (_tmp, target, store) = layered_repo();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "layering", &target, &policy())
        .unwrap()
        .id;

    let mut writer = ledger.writer(&id).unwrap();
    let target_file = writer
        .append_file(&target.join("bridge/cli.rs"))
        .unwrap();
    let offending = writer.append("core/engine.rs", import("bridge/cli.rs")).unwrap();
    writer.append("core/engine.rs", import("./model.rs")).unwrap();
    writer.append("core/engine.rs", import("util/fmt.rs")).unwrap();
    writer.append("bridge/cli.rs", import("core/engine.rs")).unwrap();
    writer.append("docs/guide.md", import("core/engine.rs")).unwrap();
    writer.finish().unwrap();

    let report = boundary::check_session(&ledger, &id).unwrap();
    assert_eq!(report.edges_checked, 5);
    assert_eq!(report.violations.len(), 1);

    let violation = &report.violations[0];
    assert_eq!(violation.source_path, "core/engine.rs");
    assert_eq!(violation.target_path, "bridge/cli.rs");
    assert_eq!(violation.source_layer, "core");
    assert_eq!(violation.target_layer, "bridge");
    assert_eq!(violation.rule_id, "boundary:core->bridge");
    assert_eq!(violation.severity, Severity::High);
    assert_eq!(violation.import_observation_id, offending.id);
    assert_eq!(violation.target_observation_id.as_deref(), Some(target_file.id.as_str()));

    assert_eq!(report.unassigned_paths, vec!["docs/guide.md".to_string()]);
    assert!(!report.limitations.is_empty());
}

#[test]
fn repeated_checks_are_identical_and_dedup_edges() {
    let (_tmp, target, store) = layered_repo();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "repeat", &target, &policy())
        .unwrap()
        .id;

    let mut writer = ledger.writer(&id).unwrap();
    writer.append("util/fmt.rs", import("core/model.rs")).unwrap();
    writer.append("util/fmt.rs", import("core/model.rs")).unwrap();
    writer.append("core/model.rs", import("bridge/cli.rs")).unwrap();
    writer.finish().unwrap();

    let first = boundary::check_session(&ledger, &id).unwrap();
    let second = boundary::check_session(&ledger, &id).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.edges_checked, 2);
    assert_eq!(first.violations.len(), 2);
    assert_eq!(first.violations[0].source_path, "core/model.rs");
    assert_eq!(first.violations[1].source_path, "util/fmt.rs");
    assert!(first.violations[1].target_observation_id.is_none());
}

#[test]
fn same_layer_imports_never_violate() {
    let (_tmp, target, store) = layered_repo();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "same layer", &target, &policy())
        .unwrap()
        .id;
    ledger
        .append(&id, "core/engine.rs", import("core/model.rs"))
        .unwrap();

    let report = boundary::check_session(&ledger, &id).unwrap();
    assert_eq!(report.edges_checked, 1);
    assert!(report.violations.is_empty());
}

#[test]
fn explicit_map_overrides_session_policy() {
    let (_tmp, target, store) = layered_repo();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "no policy", &target, &BoundaryMap::default())
        .unwrap()
        .id;
    ledger
        .append(&id, "core/engine.rs", import("bridge/cli.rs"))
        .unwrap();

    assert!(boundary::check_session(&ledger, &id).unwrap().violations.is_empty());
    let report = boundary::check(&ledger, &id, &policy()).unwrap();
    assert_eq!(report.violations.len(), 1);
}

#[test]
fn invalid_policy_is_rejected_at_session_creation() {
    let (_tmp, target, store) = layered_repo();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let bad = BoundaryMap::new(vec![LayerRule {
        name: "core".to_string(),
        pattern: "core/[".to_string(),
        allowed_targets: vec![],
        severity: Severity::Low,
    }]);
    assert!(
        ledger
            .sessions()
            .create(SessionScope::Project, "bad", &target, &bad)
            .is_err()
    );
    assert!(ledger.sessions().list().unwrap().is_empty());
}

#[test]
fn import_targets_are_normalized_and_escapes_are_reported() {
    let (_tmp, target, store) = layered_repo();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "normalize", &target, &policy())
        .unwrap()
        .id;

    let mut writer = ledger.writer(&id).unwrap();
    writer.append("core/engine.rs", import("bridge/cli.rs")).unwrap();
    writer.append("core/engine.rs", import("bridge/./cli.rs")).unwrap();
    writer.append("core/engine.rs", import("../bridge/cli.rs")).unwrap();
    writer.append("core/engine.rs", import("../../../outside.rs")).unwrap();
    writer.finish().unwrap();

    let report = boundary::check_session(&ledger, &id).unwrap();
    assert_eq!(report.edges_checked, 1);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].target_path, "bridge/cli.rs");
    assert!(report.unassigned_paths.is_empty());
    assert!(
        report
            .limitations
            .iter()
            .any(|l| l.contains("../../../outside.rs") && l.contains("outside the investigation root"))
    );
}
