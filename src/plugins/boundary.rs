//! Constitutional boundary checker.
//!
//! A [`BoundaryMap`] declares layers as ordered glob patterns plus the layers
//! each may import from. The checker classifies both ends of every `import`
//! observation (first matching layer wins, no match is "unassigned" and never
//! flagged) and reports each edge whose target layer is not allowed.
//!
//! Detection is purely syntactic: it sees what import observations recorded
//! and nothing else. Results are recomputed from the ledger on every run.

use crate::core::error::{ErrorContext, SightlineError, io_at};
use crate::core::severity::Severity;
use crate::plugins::ledger::{Ledger, ObservationKind, Payload};
use globset::{GlobBuilder, GlobMatcher};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRule {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub allowed_targets: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
}

/// Ordered layer policy. Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundaryMap {
    #[serde(default, rename = "layer")]
    pub layers: Vec<LayerRule>,
}

impl BoundaryMap {
    pub fn new(layers: Vec<LayerRule>) -> Self {
        Self { layers }
    }

    /// Parse `[[layer]]` tables:
    ///
    /// ```toml
    /// [[layer]]
    /// name = "core"
    /// pattern = "core/**"
    /// allowed_targets = ["util"]
    /// severity = "high"
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self, SightlineError> {
        let map: BoundaryMap =
            toml::from_str(content).map_err(|e| SightlineError::ConfigError(e.to_string()))?;
        map.compile()?;
        Ok(map)
    }

    pub fn load(path: &Path) -> Result<Self, SightlineError> {
        let content = fs::read_to_string(path).map_err(io_at(path))?;
        Self::from_toml_str(&content)
    }

    /// Validate and compile the globs.
    pub fn compile(&self) -> Result<CompiledBoundaryMap, SightlineError> {
        let mut names = FxHashSet::default();
        for layer in &self.layers {
            if layer.name.trim().is_empty() {
                return Err(SightlineError::ConfigError("layer name must not be empty".to_string()));
            }
            if !names.insert(layer.name.as_str()) {
                return Err(SightlineError::ConfigError(format!(
                    "layer '{}' declared more than once",
                    layer.name
                )));
            }
        }
        for layer in &self.layers {
            for target in &layer.allowed_targets {
                if !names.contains(target.as_str()) {
                    return Err(SightlineError::ConfigError(format!(
                        "layer '{}' allows unknown layer '{}'",
                        layer.name, target
                    )));
                }
            }
        }

        let mut compiled = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let matcher = GlobBuilder::new(&layer.pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    SightlineError::ConfigError(format!(
                        "layer '{}' has invalid pattern '{}': {}",
                        layer.name, layer.pattern, e
                    ))
                })?
                .compile_matcher();
            compiled.push(CompiledLayer {
                rule: layer.clone(),
                matcher,
                allowed: layer.allowed_targets.iter().cloned().collect(),
            });
        }
        Ok(CompiledBoundaryMap { layers: compiled })
    }
}

struct CompiledLayer {
    rule: LayerRule,
    matcher: GlobMatcher,
    allowed: FxHashSet<String>,
}

pub struct CompiledBoundaryMap {
    layers: Vec<CompiledLayer>,
}

impl CompiledBoundaryMap {
    /// First layer whose pattern matches `path`, in declared order.
    pub fn classify(&self, path: &str) -> Option<&LayerRule> {
        self.layers
            .iter()
            .find(|layer| layer.matcher.is_match(path))
            .map(|layer| &layer.rule)
    }

    /// A layer may always reach itself.
    pub fn allows(&self, source: &str, target: &str) -> bool {
        if source == target {
            return true;
        }
        self.layers
            .iter()
            .find(|layer| layer.rule.name == source)
            .map(|layer| layer.allowed.contains(target))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoundaryViolation {
    pub source_path: String,
    pub target_path: String,
    pub source_layer: String,
    pub target_layer: String,
    pub rule_id: String,
    pub severity: Severity,
    /// The import observation that recorded this edge.
    pub import_observation_id: String,
    /// File observation of the target, when the session recorded one.
    pub target_observation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationReport {
    pub session_id: String,
    pub violations: Vec<BoundaryViolation>,
    pub edges_checked: usize,
    pub unassigned_paths: Vec<String>,
    pub skipped_records: Vec<String>,
    pub limitations: Vec<String>,
}

/// Resolve `./` and `../` imports against the importing file's directory;
/// other targets are root-relative. Both are normalized lexically. `None`
/// when the target climbs out of the investigation root.
pub fn resolve_import(subject: &str, target: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if target.starts_with("./") || target.starts_with("../") {
        parts.extend(subject.split('/'));
        parts.pop();
    }
    for piece in target.trim_start_matches('/').split('/') {
        match piece {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn rule_id(source_layer: &str, target_layer: &str) -> String {
    format!("boundary:{}->{}", source_layer, target_layer)
}

/// Derive the violation set for one session from its committed import
/// observations.
pub fn check(
    ledger: &Ledger,
    session_id: &str,
    map: &BoundaryMap,
) -> Result<ViolationReport, SightlineError> {
    let compiled = map.compile()?;

    let mut edges: BTreeMap<(String, String), String> = BTreeMap::new();
    let mut file_observations: FxHashMap<String, String> = FxHashMap::default();
    let mut skipped_records = Vec::new();
    let mut escaping = BTreeSet::new();

    let mut reader = ledger.read(session_id)?;
    for item in &mut reader {
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
        match &observation.payload {
            Payload::Import(import) => {
                let Some(target) = resolve_import(&observation.subject, &import.target) else {
                    escaping.insert((observation.subject.clone(), import.target.clone()));
                    continue;
                };
                edges
                    .entry((observation.subject.clone(), target))
                    .or_insert(observation.id.clone());
            }
            Payload::File(_) => {
                file_observations
                    .entry(observation.subject.clone())
                    .or_insert(observation.id.clone());
            }
            Payload::Export(_) | Payload::Boundary(_) => {}
        }
    }

    let mut violations = BTreeSet::new();
    let mut unassigned = BTreeSet::new();
    for ((source, target), import_id) in &edges {
        let source_layer = compiled.classify(source);
        let target_layer = compiled.classify(target);
        let (Some(source_layer), Some(target_layer)) = (source_layer, target_layer) else {
            if source_layer.is_none() {
                unassigned.insert(source.clone());
            }
            if target_layer.is_none() {
                unassigned.insert(target.clone());
            }
            continue;
        };
        if compiled.allows(&source_layer.name, &target_layer.name) {
            continue;
        }
        violations.insert(BoundaryViolation {
            source_path: source.clone(),
            target_path: target.clone(),
            source_layer: source_layer.name.clone(),
            target_layer: target_layer.name.clone(),
            rule_id: rule_id(&source_layer.name, &target_layer.name),
            severity: source_layer.severity,
            import_observation_id: import_id.clone(),
            target_observation_id: file_observations.get(target).cloned(),
        });
    }

    tracing::debug!(
        session_id,
        edges = edges.len(),
        violations = violations.len(),
        "boundary check complete"
    );

    Ok(ViolationReport {
        session_id: session_id.to_string(),
        violations: violations.into_iter().collect(),
        edges_checked: edges.len(),
        unassigned_paths: unassigned.into_iter().collect(),
        skipped_records,
        limitations: ObservationKind::Import
            .limitations()
            .iter()
            .map(|s| s.to_string())
            .chain(escaping.into_iter().map(|(subject, target)| {
                format!(
                    "import '{}' in {} resolves outside the investigation root; not checked",
                    target, subject
                )
            }))
            .collect(),
    })
}

/// Check against the policy the session was created with.
pub fn check_session(ledger: &Ledger, session_id: &str) -> Result<ViolationReport, SightlineError> {
    let manifest = ledger.sessions().manifest(session_id)?;
    if manifest.session_id != session_id {
        return Err(SightlineError::corruption(
            format!("manifest belongs to session {}", manifest.session_id),
            ErrorContext::session(session_id),
        ));
    }
    check(ledger, session_id, &manifest.policy)
}
