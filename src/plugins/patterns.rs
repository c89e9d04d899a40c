//! Pattern engine.
//!
//! Two independent detector kinds run over a session's observations and
//! never modify them:
//!
//! - **Rules**: deterministic predicates over a single observation. A match
//!   has confidence 1.0.
//! - **Statistical outliers**: for a metric computed per subject inside a
//!   cohort, flag subjects whose z-score exceeds the threshold. No claim is
//!   made for cohorts smaller than `min_cohort` or with zero spread; those
//!   cohorts are listed as limitations in the report instead.

use crate::core::config::PatternConfig;
use crate::core::error::{SightlineError, io_at};
use crate::core::severity::Severity;
use crate::plugins::boundary;
use crate::plugins::ledger::{Ledger, Observation, ObservationKind, Payload};
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const STATISTICAL_OUTLIER: &str = "statistical-outlier";
const RULE_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Performance,
    Style,
    Architecture,
}

#[derive(Debug, Clone)]
pub enum RulePredicate {
    SubjectMatches(Regex),
    ImportTargetMatches(Regex),
    ExportSymbolMatches(Regex),
    FileLargerThan(u64),
    KindIs(ObservationKind),
    All(Vec<RulePredicate>),
    Any(Vec<RulePredicate>),
    Not(Box<RulePredicate>),
}

impl RulePredicate {
    pub fn matches(&self, observation: &Observation) -> bool {
        match self {
            RulePredicate::SubjectMatches(re) => re.is_match(&observation.subject),
            RulePredicate::ImportTargetMatches(re) => {
                matches!(&observation.payload, Payload::Import(i) if re.is_match(&i.target))
            }
            RulePredicate::ExportSymbolMatches(re) => {
                matches!(&observation.payload, Payload::Export(e) if re.is_match(&e.symbol))
            }
            RulePredicate::FileLargerThan(bytes) => {
                matches!(&observation.payload, Payload::File(f) if f.size_bytes > *bytes)
            }
            RulePredicate::KindIs(kind) => observation.kind == *kind,
            RulePredicate::All(preds) => preds.iter().all(|p| p.matches(observation)),
            RulePredicate::Any(preds) => preds.iter().any(|p| p.matches(observation)),
            RulePredicate::Not(pred) => !pred.matches(observation),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub category: Category,
    pub severity: Severity,
    pub predicate: RulePredicate,
}

/// Serializable predicate form used in rule files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateSpec {
    SubjectMatches { pattern: String },
    ImportTargetMatches { pattern: String },
    ExportSymbolMatches { pattern: String },
    FileLargerThan { bytes: u64 },
    KindIs { observation: ObservationKind },
    All { of: Vec<PredicateSpec> },
    Any { of: Vec<PredicateSpec> },
    Not { predicate: Box<PredicateSpec> },
}

impl PredicateSpec {
    pub fn compile(&self) -> Result<RulePredicate, SightlineError> {
        let regex = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| SightlineError::ConfigError(format!("invalid pattern '{}': {}", pattern, e)))
        };
        Ok(match self {
            PredicateSpec::SubjectMatches { pattern } => RulePredicate::SubjectMatches(regex(pattern)?),
            PredicateSpec::ImportTargetMatches { pattern } => {
                RulePredicate::ImportTargetMatches(regex(pattern)?)
            }
            PredicateSpec::ExportSymbolMatches { pattern } => {
                RulePredicate::ExportSymbolMatches(regex(pattern)?)
            }
            PredicateSpec::FileLargerThan { bytes } => RulePredicate::FileLargerThan(*bytes),
            PredicateSpec::KindIs { observation } => RulePredicate::KindIs(*observation),
            PredicateSpec::All { of } => {
                RulePredicate::All(of.iter().map(|p| p.compile()).collect::<Result<_, _>>()?)
            }
            PredicateSpec::Any { of } => {
                RulePredicate::Any(of.iter().map(|p| p.compile()).collect::<Result<_, _>>()?)
            }
            PredicateSpec::Not { predicate } => RulePredicate::Not(Box::new(predicate.compile()?)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub category: Category,
    #[serde(default)]
    pub severity: Severity,
    pub predicate: PredicateSpec,
}

impl RuleSpec {
    pub fn compile(&self) -> Result<Rule, SightlineError> {
        if self.id.trim().is_empty() {
            return Err(SightlineError::ConfigError("rule id must not be empty".to_string()));
        }
        if self.id == STATISTICAL_OUTLIER {
            return Err(SightlineError::ConfigError(format!(
                "rule id '{}' is reserved",
                STATISTICAL_OUTLIER
            )));
        }
        Ok(Rule {
            id: self.id.clone(),
            category: self.category,
            severity: self.severity,
            predicate: self.predicate.compile()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<RuleSpec>,
}

/// Parse `[[rule]]` tables:
///
/// ```toml
/// [[rule]]
/// id = "no-env-files"
/// category = "security"
/// severity = "high"
/// predicate = { kind = "subject_matches", pattern = "(^|/)\\.env$" }
/// ```
pub fn rules_from_toml_str(content: &str) -> Result<Vec<Rule>, SightlineError> {
    let file: RuleFile =
        toml::from_str(content).map_err(|e| SightlineError::ConfigError(e.to_string()))?;
    let mut seen = FxHashSet::default();
    let mut rules = Vec::with_capacity(file.rule.len());
    for spec in &file.rule {
        if !seen.insert(spec.id.clone()) {
            return Err(SightlineError::ConfigError(format!("rule '{}' declared twice", spec.id)));
        }
        rules.push(spec.compile()?);
    }
    Ok(rules)
}

/// Missing file = no rules.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, SightlineError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(io_at(path))?;
    rules_from_toml_str(&content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    FileSize,
    LineCount,
    /// Distinct import targets per subject.
    FanOut,
    ExportCount,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::FileSize => "file_size",
            Metric::LineCount => "line_count",
            Metric::FanOut => "fan_out",
            Metric::ExportCount => "export_count",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortBy {
    /// Every subject in the session.
    Session,
    /// Subjects sharing a parent directory.
    Directory,
}

impl CohortBy {
    fn key(&self, subject: &str) -> String {
        match self {
            CohortBy::Session => "session".to_string(),
            CohortBy::Directory => match subject.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => ".".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierDetector {
    pub metric: Metric,
    pub cohort_by: CohortBy,
    pub category: Category,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBasis {
    pub metric: String,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
    pub cohort: String,
    pub cohort_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub category: Category,
    pub severity: Severity,
    pub subject: String,
    pub confidence: f64,
    pub observation_id: Option<String>,
    pub metric: Option<MetricBasis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    pub session_id: String,
    pub matches: Vec<PatternMatch>,
    pub observations_scanned: usize,
    pub skipped_records: Vec<String>,
    pub limitations: Vec<String>,
}

/// Outcome of one outlier pass over one cohort.
#[derive(Debug, Clone, PartialEq)]
pub enum OutlierOutcome {
    /// Fewer than `min_cohort` subjects.
    TooSmall { size: usize },
    /// Every subject has the same value.
    NoSpread { size: usize, mean: f64 },
    Evaluated {
        mean: f64,
        std_dev: f64,
        outliers: Vec<(String, f64, f64)>,
    },
}

/// Sample mean and sample standard deviation (n - 1).
pub fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

/// z-score outliers for `(subject, value)` pairs. Outliers are returned as
/// `(subject, value, z)`.
pub fn detect_outliers(samples: &[(String, f64)], min_cohort: usize, z_threshold: f64) -> OutlierOutcome {
    if samples.len() < min_cohort {
        return OutlierOutcome::TooSmall { size: samples.len() };
    }
    let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
    let (mean, std_dev) = mean_and_std_dev(&values);
    if std_dev <= f64::EPSILON * mean.abs().max(1.0) {
        return OutlierOutcome::NoSpread {
            size: samples.len(),
            mean,
        };
    }
    let outliers = samples
        .iter()
        .filter_map(|(subject, value)| {
            let z = (value - mean) / std_dev;
            (z.abs() > z_threshold).then(|| (subject.clone(), *value, z))
        })
        .collect();
    OutlierOutcome::Evaluated {
        mean,
        std_dev,
        outliers,
    }
}

/// `min(1, |z| / threshold)`: monotonic in |z|, saturating at 1.
pub fn outlier_confidence(z: f64, threshold: f64) -> f64 {
    (z.abs() / threshold).min(1.0)
}

#[derive(Debug, Default)]
struct SubjectMetrics {
    file_size: Option<u64>,
    line_count: Option<u64>,
    import_targets: FxHashSet<String>,
    exports: u64,
    has_file: bool,
}

impl SubjectMetrics {
    fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::FileSize => self.file_size.map(|v| v as f64),
            Metric::LineCount => self.line_count.map(|v| v as f64),
            Metric::FanOut => Some(self.import_targets.len() as f64),
            Metric::ExportCount => self.has_file.then_some(self.exports as f64),
        }
    }
}

pub struct PatternEngine {
    rules: Vec<Rule>,
    detectors: Vec<OutlierDetector>,
    min_cohort: usize,
    z_threshold: f64,
}

impl PatternEngine {
    /// Engine with the default detectors (file size and fan-out over the
    /// whole session) and no rules.
    pub fn new(config: &PatternConfig) -> Self {
        Self {
            rules: Vec::new(),
            detectors: vec![
                OutlierDetector {
                    metric: Metric::FileSize,
                    cohort_by: CohortBy::Session,
                    category: Category::Performance,
                    severity: Severity::Medium,
                },
                OutlierDetector {
                    metric: Metric::FanOut,
                    cohort_by: CohortBy::Session,
                    category: Category::Architecture,
                    severity: Severity::Medium,
                },
            ],
            min_cohort: config.min_cohort,
            z_threshold: config.z_threshold,
        }
    }

    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_detectors(mut self, detectors: Vec<OutlierDetector>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn run(&self, ledger: &Ledger, session_id: &str) -> Result<PatternReport, SightlineError> {
        let mut matches = Vec::new();
        let mut metrics: FxHashMap<String, SubjectMetrics> = FxHashMap::default();
        let mut skipped_records = Vec::new();
        let mut scanned = 0usize;
        let mut batch = Vec::with_capacity(RULE_BATCH);

        for item in ledger.read(session_id)? {
            let observation = match item {
                Ok(observation) => observation,
                Err(err) => {
                    let record_id = err
                        .context()
                        .and_then(|c| c.record_id.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    tracing::warn!(session_id, record_id = %record_id, error = %err, "skipping unreadable observation");
                    skipped_records.push(record_id);
                    continue;
                }
            };
            scanned += 1;
            accumulate(&mut metrics, &observation);
            batch.push(observation);
            if batch.len() == RULE_BATCH {
                matches.extend(self.match_rules(&batch));
                batch.clear();
            }
        }
        matches.extend(self.match_rules(&batch));

        let (statistical, limitations) = self.detect(&metrics);
        matches.extend(statistical);

        Ok(PatternReport {
            session_id: session_id.to_string(),
            matches,
            observations_scanned: scanned,
            skipped_records,
            limitations,
        })
    }

    /// Rule matches for a batch, in input order.
    pub fn match_rules(&self, observations: &[Observation]) -> Vec<PatternMatch> {
        if self.rules.is_empty() {
            return Vec::new();
        }
        observations
            .par_iter()
            .map(|observation| {
                self.rules
                    .iter()
                    .filter(|rule| rule.predicate.matches(observation))
                    .map(|rule| PatternMatch {
                        pattern_id: rule.id.clone(),
                        category: rule.category,
                        severity: rule.severity,
                        subject: observation.subject.clone(),
                        confidence: 1.0,
                        observation_id: Some(observation.id.clone()),
                        metric: None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }

    fn detect(&self, metrics: &FxHashMap<String, SubjectMetrics>) -> (Vec<PatternMatch>, Vec<String>) {
        let mut matches = Vec::new();
        let mut limitations = Vec::new();

        for detector in &self.detectors {
            let mut cohorts: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
            for (subject, m) in metrics {
                if let Some(value) = m.value(detector.metric) {
                    cohorts
                        .entry(detector.cohort_by.key(subject))
                        .or_default()
                        .push((subject.clone(), value));
                }
            }

            for (cohort, mut samples) in cohorts {
                samples.sort_by(|a, b| a.0.cmp(&b.0));
                match detect_outliers(&samples, self.min_cohort, self.z_threshold) {
                    OutlierOutcome::TooSmall { size } => limitations.push(format!(
                        "{} in cohort '{}': {} subjects is below the minimum of {}; no statistical claim made",
                        detector.metric, cohort, size, self.min_cohort
                    )),
                    OutlierOutcome::NoSpread { size, .. } => limitations.push(format!(
                        "{} in cohort '{}': all {} subjects share one value; detection suppressed",
                        detector.metric, cohort, size
                    )),
                    OutlierOutcome::Evaluated {
                        mean,
                        std_dev,
                        outliers,
                    } => {
                        for (subject, value, z) in outliers {
                            matches.push(PatternMatch {
                                pattern_id: STATISTICAL_OUTLIER.to_string(),
                                category: detector.category,
                                severity: detector.severity,
                                subject,
                                confidence: outlier_confidence(z, self.z_threshold),
                                observation_id: None,
                                metric: Some(MetricBasis {
                                    metric: detector.metric.name().to_string(),
                                    value,
                                    mean,
                                    std_dev,
                                    z_score: z,
                                    cohort: cohort.clone(),
                                    cohort_size: samples.len(),
                                }),
                            });
                        }
                    }
                }
            }
        }
        (matches, limitations)
    }
}

fn accumulate(metrics: &mut FxHashMap<String, SubjectMetrics>, observation: &Observation) {
    let entry = metrics.entry(observation.subject.clone()).or_default();
    match &observation.payload {
        Payload::File(f) => {
            entry.has_file = true;
            entry.file_size = Some(f.size_bytes);
            entry.line_count = Some(f.line_count);
        }
        Payload::Import(i) => {
            let target = boundary::resolve_import(&observation.subject, &i.target)
                .unwrap_or_else(|| i.target.clone());
            entry.import_targets.insert(target);
        }
        Payload::Export(_) => entry.exports += 1,
        Payload::Boundary(_) => {}
    }
}
