//! Rule-document shape, validation, loading, and the process-wide cache.
//!
//! Documents live at `{dir}/{name_lower}.{version}.json` and are immutable
//! once cached. Validation happens entirely at load time so that a
//! malformed document fails the run before any scoring transaction opens.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;

/// Errors raised while loading or validating a rule document.
#[derive(Debug)]
pub enum RuleDocError {
    Io { path: PathBuf, detail: String },
    Parse { path: PathBuf, detail: String },
    Validation { path: PathBuf, detail: String },
    /// A rule uses an operator the evaluator does not know.
    BadRule { rule_id: String, op: String },
}

impl fmt::Display for RuleDocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleDocError::Io { path, detail } => {
                write!(f, "rule document read failed: {}: {detail}", path.display())
            }
            RuleDocError::Parse { path, detail } => {
                write!(f, "rule document is not valid JSON: {}: {detail}", path.display())
            }
            RuleDocError::Validation { path, detail } => {
                write!(f, "rule document invalid: {}: {detail}", path.display())
            }
            RuleDocError::BadRule { rule_id, op } => {
                write!(f, "rule '{rule_id}' uses unknown operator '{op}'")
            }
        }
    }
}

impl std::error::Error for RuleDocError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Severity {
    Major,
    Minor,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Major => "Major",
            Severity::Minor => "Minor",
        }
    }
}

/// Document-level answer normalisation defaults; rules may override `trim`
/// and `caseInsensitive` per condition.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Normalization {
    pub trim: bool,
    pub case_insensitive: bool,
    pub empty_is_null: bool,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            trim: true,
            case_insensitive: false,
            empty_is_null: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub op: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub values: Option<Vec<Value>>,
    #[serde(default)]
    pub trim: Option<bool>,
    #[serde(default)]
    pub case_insensitive: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingSpec {
    pub severity: Severity,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub major_non_compliant_text: Option<String>,
    #[serde(default)]
    pub minor_non_compliant_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_id: String,
    pub question_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra keys counted for resolver eligibility overlap only.
    #[serde(default)]
    pub question_keys_any: Vec<String>,
    pub non_compliant_when: RuleCondition,
    pub finding: FindingSpec,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeWhen {
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub major_count_gte: Option<u32>,
    #[serde(default)]
    pub minor_count_gte: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRule {
    pub when: OutcomeWhen,
    pub outcome: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreValueSpec {
    #[serde(rename = "type")]
    pub value_type: String,
    pub from: String,
    #[serde(default)]
    pub fixed_value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scoring {
    pub outcome_rules: Vec<OutcomeRule>,
    pub score_value: ScoreValueSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDocument {
    pub rule_set_name: String,
    pub rule_set_version: String,
    #[serde(default)]
    pub answer_normalization: Normalization,
    pub rules: Vec<Rule>,
    pub scoring: Scoring,
    #[serde(default)]
    pub ignore_question_keys: Vec<String>,
    /// Question keys a report may overlap with to be eligible: every rule's
    /// `questionKey`, the union of `questionKeysAny`, plus the ignore list.
    /// Populated during validation, never serialised.
    #[serde(skip)]
    eligibility: HashSet<String>,
}

impl RuleDocument {
    pub fn eligibility_keys(&self) -> &HashSet<String> {
        &self.eligibility
    }

    fn validate(&mut self, path: &Path, name: &str, version: &str) -> Result<(), RuleDocError> {
        let invalid = |detail: String| RuleDocError::Validation {
            path: path.to_path_buf(),
            detail,
        };

        if !self.rule_set_name.eq_ignore_ascii_case(name) {
            return Err(invalid(format!(
                "ruleSetName '{}' does not match requested '{name}'",
                self.rule_set_name
            )));
        }
        if self.rule_set_version != version {
            return Err(invalid(format!(
                "ruleSetVersion '{}' does not match requested '{version}'",
                self.rule_set_version
            )));
        }
        if self.scoring.outcome_rules.is_empty() {
            return Err(invalid("scoring.outcomeRules must not be empty".into()));
        }
        for (idx, outcome) in self.scoring.outcome_rules.iter().enumerate() {
            let when = &outcome.when;
            if !when.always && when.major_count_gte.is_none() && when.minor_count_gte.is_none() {
                return Err(invalid(format!(
                    "scoring.outcomeRules[{idx}] has no recognised 'when' shape"
                )));
            }
        }

        for rule in &self.rules {
            match rule.non_compliant_when.op.as_str() {
                "missing" => {}
                "equals" => {
                    if rule.non_compliant_when.value.is_none() {
                        return Err(invalid(format!(
                            "rule '{}' uses op 'equals' without a value",
                            rule.rule_id
                        )));
                    }
                }
                "in" => {
                    let empty = rule
                        .non_compliant_when
                        .values
                        .as_ref()
                        .map_or(true, |v| v.is_empty());
                    if empty {
                        return Err(invalid(format!(
                            "rule '{}' uses op 'in' without values",
                            rule.rule_id
                        )));
                    }
                }
                other => {
                    return Err(RuleDocError::BadRule {
                        rule_id: rule.rule_id.clone(),
                        op: other.to_string(),
                    })
                }
            }
        }

        let mut eligibility: HashSet<String> = HashSet::new();
        for rule in &self.rules {
            eligibility.insert(rule.question_key.clone());
            eligibility.extend(rule.question_keys_any.iter().cloned());
        }
        eligibility.extend(self.ignore_question_keys.iter().cloned());
        self.eligibility = eligibility;
        Ok(())
    }
}

/// Path of the document for `(name, version)` under `dir`.
pub fn document_path(dir: &Path, name: &str, version: &str) -> PathBuf {
    dir.join(format!("{}.{}.json", name.to_lowercase(), version))
}

/// Load and validate a document from disk, bypassing the cache.
pub fn load_document(dir: &Path, name: &str, version: &str) -> Result<RuleDocument, RuleDocError> {
    let path = document_path(dir, name, version);
    let raw = fs::read_to_string(&path).map_err(|e| RuleDocError::Io {
        path: path.clone(),
        detail: e.to_string(),
    })?;
    let mut doc: RuleDocument = serde_json::from_str(&raw).map_err(|e| RuleDocError::Parse {
        path: path.clone(),
        detail: e.to_string(),
    })?;
    doc.validate(&path, name, version)?;
    Ok(doc)
}

type CacheKey = (PathBuf, String, String);

static DOC_CACHE: Lazy<RwLock<HashMap<CacheKey, Arc<RuleDocument>>>> =
    Lazy::new(Default::default);

/// Load through the process-wide cache. Safe under concurrent readers; the
/// first access per `(dir, lowercased name, version)` populates the entry
/// and the document is never mutated afterwards.
pub fn cached_document(
    dir: &Path,
    name: &str,
    version: &str,
) -> Result<Arc<RuleDocument>, RuleDocError> {
    let key: CacheKey = (dir.to_path_buf(), name.to_lowercase(), version.to_string());
    if let Some(doc) = DOC_CACHE.read().expect("rule cache poisoned").get(&key) {
        return Ok(Arc::clone(doc));
    }
    let doc = Arc::new(load_document(dir, name, version)?);
    let mut cache = DOC_CACHE.write().expect("rule cache poisoned");
    let entry = cache.entry(key).or_insert_with(|| Arc::clone(&doc));
    Ok(Arc::clone(entry))
}
