use sightline::Investigator;
use sightline::core::config::{EngineConfig, PatternConfig};
use sightline::core::severity::Severity;
use sightline::core::store::Store;
use sightline::plugins::boundary::BoundaryMap;
use sightline::plugins::ledger::{ExportFacts, FileFacts, ImportFacts, Ledger, Payload};
use sightline::plugins::patterns::{
    Category, CohortBy, Metric, OutlierDetector, PatternEngine, PredicateSpec, RuleSpec,
    STATISTICAL_OUTLIER,
};
use sightline::plugins::session::SessionScope;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

fn setup() -> (TempDir, PathBuf, PathBuf) {
    let tmp = tempdir().expect("tempdir");
    let target = tmp.path().join("repo");
    fs::create_dir_all(&target).unwrap();
    let state = tmp.path().join("state");
    (tmp, target, state)
}

fn file(size: u64) -> Payload {
    Payload::File(FileFacts {
        size_bytes: size,
        line_count: size / 10,
        content_digest: format!("{:064x}", size),
    })
}

fn session_with_sizes(ledger: &Ledger, target: &Path, sizes: &[u64]) -> String {
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "sizes", target, &BoundaryMap::default())
        .unwrap()
        .id;
    let mut writer = ledger.writer(&id).unwrap();
    for (i, size) in sizes.iter().enumerate() {
        writer.append(&format!("src/f{:02}.rs", i), file(*size)).unwrap();
    }
    writer.finish().unwrap();
    id
}

fn size_engine() -> PatternEngine {
    PatternEngine::new(&PatternConfig::default()).with_detectors(vec![OutlierDetector {
        metric: Metric::FileSize,
        cohort_by: CohortBy::Session,
        category: Category::Performance,
        severity: Severity::Medium,
    }])
}

#[test]
fn one_large_file_among_uniform_peers_is_an_outlier() {
    let (_tmp, target, state) = setup();
    let store = Store::open(&state).unwrap();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let mut sizes = vec![100; 10];
    sizes.push(500);
    let id = session_with_sizes(&ledger, &target, &sizes);

    let report = size_engine().run(&ledger, &id).unwrap();
    assert_eq!(report.observations_scanned, 11);
    assert_eq!(report.matches.len(), 1);

    let hit = &report.matches[0];
    assert_eq!(hit.pattern_id, STATISTICAL_OUTLIER);
    assert_eq!(hit.subject, "src/f10.rs");
    assert_eq!(hit.category, Category::Performance);
    let basis = hit.metric.as_ref().expect("statistical basis");
    assert_eq!(basis.metric, "file_size");
    assert_eq!(basis.value, 500.0);
    assert_eq!(basis.cohort_size, 11);
    assert!(basis.z_score > 2.0);
    assert!(hit.confidence > 0.0 && hit.confidence <= 1.0);
}

#[test]
fn cohort_below_minimum_makes_no_claim() {
    let (_tmp, target, state) = setup();
    let store = Store::open(&state).unwrap();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = session_with_sizes(&ledger, &target, &[10, 10, 90_000]);

    let report = size_engine().run(&ledger, &id).unwrap();
    assert!(report.matches.is_empty());
    assert!(report.limitations.iter().any(|l| l.contains("below the minimum")));
}

#[test]
fn zero_spread_cohort_is_suppressed() {
    let (_tmp, target, state) = setup();
    let store = Store::open(&state).unwrap();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = session_with_sizes(&ledger, &target, &[100; 6]);

    let report = size_engine().run(&ledger, &id).unwrap();
    assert!(report.matches.is_empty());
    assert!(report.limitations.iter().any(|l| l.contains("suppressed")));
}

#[test]
fn rule_matches_carry_full_confidence_in_ledger_order() {
    let (_tmp, target, state) = setup();
    let store = Store::open(&state).unwrap();
    let ledger = Ledger::new(&store, &EngineConfig::default());
    let id = ledger
        .sessions()
        .create(SessionScope::Project, "rules", &target, &BoundaryMap::default())
        .unwrap()
        .id;
    let mut writer = ledger.writer(&id).unwrap();
    let a = writer
        .append(
            "src/net.rs",
            Payload::Import(ImportFacts {
                target: "vendor/openssl/sys.rs".to_string(),
                line: Some(4),
                statement: None,
            }),
        )
        .unwrap();
    writer
        .append(
            "src/net.rs",
            Payload::Export(ExportFacts {
                symbol: "connect".to_string(),
                line: None,
            }),
        )
        .unwrap();
    let b = writer
        .append(
            "src/tls.rs",
            Payload::Import(ImportFacts {
                target: "vendor/openssl/ssl.rs".to_string(),
                line: Some(9),
                statement: None,
            }),
        )
        .unwrap();
    writer.finish().unwrap();

    let rule = RuleSpec {
        id: "direct-openssl".to_string(),
        category: Category::Security,
        severity: Severity::High,
        predicate: PredicateSpec::ImportTargetMatches {
            pattern: "^vendor/openssl/".to_string(),
        },
    }
    .compile()
    .unwrap();
    let report = PatternEngine::new(&PatternConfig::default())
        .with_rules(vec![rule])
        .with_detectors(vec![])
        .run(&ledger, &id)
        .unwrap();

    let ids: Vec<_> = report
        .matches
        .iter()
        .map(|m| m.observation_id.clone().unwrap())
        .collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert!(report.matches.iter().all(|m| m.confidence == 1.0));
    assert!(report.matches.iter().all(|m| m.metric.is_none()));
}

#[test]
fn investigator_loads_rules_from_the_store() {
    let (_tmp, target, state) = setup();
    let investigator = Investigator::open(&state).unwrap();
    fs::write(
        state.join("patterns.toml"),
        r#"
        [[rule]]
        id = "env-file"
        category = "security"
        severity = "critical"

        [rule.predicate]
        kind = "all"
        of = [
            { kind = "kind_is", observation = "file" },
            { kind = "subject_matches", pattern = "\\.env$" },
        ]
        "#,
    )
    .unwrap();

    let id = investigator
        .create_session(&target, SessionScope::Project, "secrets", &BoundaryMap::default())
        .unwrap();
    investigator.ledger().append(&id, ".env", file(42)).unwrap();
    investigator.ledger().append(&id, "src/env.rs", file(42)).unwrap();

    let report = investigator.list_pattern_matches(&id).unwrap();
    let rule_hits: Vec<_> = report
        .matches
        .iter()
        .filter(|m| m.pattern_id == "env-file")
        .collect();
    assert_eq!(rule_hits.len(), 1);
    assert_eq!(rule_hits[0].subject, ".env");
    assert_eq!(rule_hits[0].severity, Severity::Critical);

    let again = investigator.list_pattern_matches(&id).unwrap();
    assert_eq!(report, again);
}
