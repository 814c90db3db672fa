//! Decides which rule set applies to a report.
//!
//! Resolution order: report metadata hints, then hints inside the details
//! payload, then question-key overlap against each configured rule set's
//! eligibility keys. A report that resolves nowhere is skipped by scoring
//! with a structured reason; the resolver never guesses on a tie.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

/// Metadata / payload keys worth scanning for ruleset hints.
const HINT_KEY_FRAGMENTS: [&str; 4] = ["ruleset", "technology", "assessment", "template"];

/// One configured rule set with its version and eligibility keys.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    pub eligibility: HashSet<String>,
}

/// Every rule set the deployment knows about, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct RulesetCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl RulesetCatalog {
    fn version_of(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { name: String, version: String },
    Unresolved { reason: String },
}

/// Map a hint value to a canonical ruleset name.
fn name_from_hint(value: &str) -> Option<&'static str> {
    let v = value.to_lowercase();
    if v.contains("photovoltaic") || v.contains("solar") || v.contains("pv") {
        return Some("PV");
    }
    if v.contains("heat pump") || v.contains("heatpump") || v.contains("hp") {
        return Some("HeatPump");
    }
    None
}

fn is_hint_key(key: &str) -> bool {
    // Normalise away separators so `rule_set_name`, `RuleSetName`, and
    // `ruleset` all match the same fragment.
    let k = key.to_lowercase().replace(['_', '-', ' '], "");
    HINT_KEY_FRAGMENTS.iter().any(|frag| k.contains(frag))
}

fn scan_metadata(metadata: &BTreeMap<String, String>) -> Option<&'static str> {
    metadata
        .iter()
        .filter(|(k, _)| is_hint_key(k))
        .find_map(|(_, v)| name_from_hint(v))
}

fn scan_payload(rows: &[Value]) -> Option<&'static str> {
    for row in rows {
        let Some(obj) = row.as_object() else { continue };
        for (k, v) in obj {
            if !is_hint_key(k) {
                continue;
            }
            if let Some(name) = v.as_str().and_then(name_from_hint) {
                return Some(name);
            }
        }
    }
    None
}

/// Pick the entry whose eligibility keys overlap the observed question keys
/// strictly more than any other entry's. A tie, or no overlap at all, stays
/// unresolved.
fn best_overlap<'a>(
    question_keys: &HashSet<String>,
    catalog: &'a RulesetCatalog,
) -> Result<&'a CatalogEntry, String> {
    let mut scored: Vec<(usize, &CatalogEntry)> = catalog
        .entries
        .iter()
        .map(|entry| {
            let overlap = entry
                .eligibility
                .iter()
                .filter(|k| question_keys.contains(*k))
                .count();
            (overlap, entry)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    match scored.as_slice() {
        [] => Err("no rulesets configured".to_string()),
        [(0, _), ..] => Err("no question-key overlap with any ruleset".to_string()),
        [(_, entry)] => Ok(entry),
        [(best, entry), (second, runner_up), ..] => {
            if best > second {
                Ok(entry)
            } else {
                Err(format!(
                    "ambiguous question-key overlap: {} and {} both match {} keys",
                    entry.name, runner_up.name, best
                ))
            }
        }
    }
}

/// Resolve `(name, version)` for a report.
pub fn resolve_ruleset(
    metadata: &BTreeMap<String, String>,
    payload_rows: &[Value],
    question_keys: &HashSet<String>,
    catalog: &RulesetCatalog,
) -> Resolution {
    let hinted = scan_metadata(metadata).or_else(|| scan_payload(payload_rows));
    if let Some(name) = hinted {
        return match catalog.version_of(name) {
            Some(entry) => Resolution::Resolved {
                name: entry.name.clone(),
                version: entry.version.clone(),
            },
            None => Resolution::Unresolved {
                reason: format!("hinted ruleset '{name}' has no configured version"),
            },
        };
    }

    match best_overlap(question_keys, catalog) {
        Ok(entry) => Resolution::Resolved {
            name: entry.name.clone(),
            version: entry.version.clone(),
        },
        Err(reason) => Resolution::Unresolved { reason },
    }
}
