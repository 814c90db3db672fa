//! Pure rule evaluation over an answer map.
//!
//! No I/O: the stage loads answers and the document, this module decides
//! findings, counts, outcome, and the derived score value. Rules are
//! evaluated in declaration order and each produces at most one finding.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::document::{Normalization, RuleCondition, RuleDocument, Severity};

#[derive(Debug)]
pub enum EvalError {
    /// Operator the evaluator does not know. Load-time validation makes
    /// this unreachable for cached documents; it is kept so evaluation of
    /// an arbitrary document is still total.
    BadRule { rule_id: String, op: String },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::BadRule { rule_id, op } => {
                write!(f, "rule '{rule_id}' uses unknown operator '{op}'")
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// One non-compliance produced by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedFinding {
    pub question_key: String,
    /// The stored (un-normalised) answer at evaluation time.
    pub answer_value: Option<String>,
    pub severity: Severity,
    pub code: Option<String>,
    pub message: String,
    /// Populated only for Major findings, from the producing rule.
    pub major_non_compliant_text: Option<String>,
    /// Populated only for Minor findings, from the producing rule.
    pub minor_non_compliant_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub findings: Vec<EvaluatedFinding>,
    pub major_count: u32,
    pub minor_count: u32,
    pub outcome: String,
    pub score_value: Option<String>,
}

/// String form of a JSON scalar the way answers are persisted: null stays
/// null, scalars coerce, structured values serialise.
pub fn value_to_answer_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => serde_json::to_string(other).ok(),
    }
}

fn effective_options(doc: &Normalization, cond: &RuleCondition) -> Normalization {
    Normalization {
        trim: cond.trim.unwrap_or(doc.trim),
        case_insensitive: cond.case_insensitive.unwrap_or(doc.case_insensitive),
        empty_is_null: doc.empty_is_null,
    }
}

/// Normalise an answer: null stays null; trim, empty-to-null, then lowercase
/// per the effective options.
fn normalize(raw: Option<&str>, opts: &Normalization) -> Option<String> {
    let raw = raw?;
    let mut s = if opts.trim { raw.trim().to_string() } else { raw.to_string() };
    if opts.empty_is_null && s.is_empty() {
        return None;
    }
    if opts.case_insensitive {
        s = s.to_lowercase();
    }
    Some(s)
}

fn normalize_value(v: &Value, opts: &Normalization) -> Option<String> {
    normalize(value_to_answer_string(v).as_deref(), opts)
}

/// Evaluate `doc` against `answers`. Keys absent from the map and keys
/// stored with a null value are both "null" to the operators.
pub fn evaluate(
    doc: &RuleDocument,
    answers: &HashMap<String, Option<String>>,
) -> Result<Evaluation, EvalError> {
    let mut findings = Vec::new();
    let mut major_count = 0u32;
    let mut minor_count = 0u32;

    for rule in &doc.rules {
        if !rule.enabled {
            continue;
        }
        let raw = answers.get(&rule.question_key).cloned().flatten();
        let opts = effective_options(&doc.answer_normalization, &rule.non_compliant_when);
        let norm = normalize(raw.as_deref(), &opts);

        let non_compliant = match rule.non_compliant_when.op.as_str() {
            "missing" => norm.as_deref().map_or(true, str::is_empty),
            "equals" => {
                let wanted = rule
                    .non_compliant_when
                    .value
                    .as_ref()
                    .and_then(|v| normalize_value(v, &opts));
                matches!((&norm, &wanted), (Some(a), Some(w)) if a == w)
            }
            "in" => match &norm {
                None => false,
                Some(answer) => rule
                    .non_compliant_when
                    .values
                    .iter()
                    .flatten()
                    .filter_map(|v| normalize_value(v, &opts))
                    .any(|w| &w == answer),
            },
            other => {
                return Err(EvalError::BadRule {
                    rule_id: rule.rule_id.clone(),
                    op: other.to_string(),
                })
            }
        };

        if !non_compliant {
            continue;
        }
        match rule.finding.severity {
            Severity::Major => major_count += 1,
            Severity::Minor => minor_count += 1,
        }
        findings.push(EvaluatedFinding {
            question_key: rule.question_key.clone(),
            answer_value: raw,
            severity: rule.finding.severity,
            code: rule.finding.code.clone(),
            message: rule.finding.message.clone(),
            major_non_compliant_text: match rule.finding.severity {
                Severity::Major => rule.finding.major_non_compliant_text.clone(),
                Severity::Minor => None,
            },
            minor_non_compliant_text: match rule.finding.severity {
                Severity::Minor => rule.finding.minor_non_compliant_text.clone(),
                Severity::Major => None,
            },
        });
    }

    let outcome = determine_outcome(doc, major_count, minor_count);
    let score_value = derive_score_value(doc, &outcome);

    Ok(Evaluation {
        findings,
        major_count,
        minor_count,
        outcome,
        score_value,
    })
}

/// First matching outcome rule wins; precedence is positional.
fn determine_outcome(doc: &RuleDocument, major_count: u32, minor_count: u32) -> String {
    for rule in &doc.scoring.outcome_rules {
        let when = &rule.when;
        let matched = when.always
            || when.major_count_gte.is_some_and(|n| major_count >= n)
            || when.minor_count_gte.is_some_and(|n| minor_count >= n);
        if matched {
            return rule.outcome.clone();
        }
    }
    "Unknown".to_string()
}

fn derive_score_value(doc: &RuleDocument, outcome: &str) -> Option<String> {
    let spec = &doc.scoring.score_value;
    match spec.from.as_str() {
        "fixed" => spec.fixed_value.as_ref().and_then(value_to_answer_string),
        "outcome" => match spec.value_type.as_str() {
            "text" | "numeric" => Some(outcome.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::load_document;
    use std::io::Write;
    use std::path::Path;

    fn doc_from(body: &str) -> RuleDocument {
        // Route through the loader so validation and eligibility run too.
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "t.v1.json", body);
        load_document(dir.path(), "T", "v1").unwrap()
    }

    fn write_file(dir: &Path, name: &str, body: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    fn answers(pairs: &[(&str, Option<&str>)]) -> HashMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    const PV_V2: &str = r#"{
        "ruleSetName": "T",
        "ruleSetVersion": "v1",
        "answerNormalization": {"trim": true, "caseInsensitive": false, "emptyIsNull": true},
        "rules": [
            {
                "ruleId": "pv-7",
                "questionKey": "7",
                "nonCompliantWhen": {"op": "equals", "value": "Bolt-on", "caseInsensitive": true},
                "finding": {
                    "severity": "Major",
                    "code": "PV-7-BO",
                    "message": "Bolt-on not permitted",
                    "majorNonCompliantText": "Installation must not be bolt-on."
                }
            }
        ],
        "scoring": {
            "outcomeRules": [
                {"when": {"majorCountGte": 1}, "outcome": "Fail"},
                {"when": {"always": true}, "outcome": "Pass"}
            ],
            "scoreValue": {"type": "text", "from": "outcome"}
        }
    }"#;

    #[test]
    fn major_finding_fails_the_report() {
        let doc = doc_from(PV_V2);
        let eval = evaluate(&doc, &answers(&[("7", Some("bolt-ON"))])).unwrap();
        assert_eq!(eval.major_count, 1);
        assert_eq!(eval.minor_count, 0);
        assert_eq!(eval.outcome, "Fail");
        assert_eq!(eval.score_value.as_deref(), Some("Fail"));

        let finding = &eval.findings[0];
        assert_eq!(finding.question_key, "7");
        assert_eq!(finding.answer_value.as_deref(), Some("bolt-ON"));
        assert_eq!(finding.severity, Severity::Major);
        assert_eq!(
            finding.major_non_compliant_text.as_deref(),
            Some("Installation must not be bolt-on.")
        );
        assert_eq!(finding.minor_non_compliant_text, None);
    }

    #[test]
    fn compliant_answer_passes() {
        let doc = doc_from(PV_V2);
        let eval = evaluate(&doc, &answers(&[("7", Some("Roof integrated"))])).unwrap();
        assert!(eval.findings.is_empty());
        assert_eq!(eval.outcome, "Pass");
        assert_eq!(eval.score_value.as_deref(), Some("Pass"));
    }

    #[test]
    fn null_answer_never_equals() {
        let doc = doc_from(PV_V2);
        let eval = evaluate(&doc, &answers(&[("7", None)])).unwrap();
        assert!(eval.findings.is_empty());
    }

    #[test]
    fn missing_op_fires_on_absent_null_and_empty() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [
                {"ruleId": "m1", "questionKey": "q", "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Minor", "message": "answer required",
                             "minorNonCompliantText": "Provide an answer."}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "fixed", "from": "fixed", "fixedValue": 10}
            }
        }"#,
        );
        for case in [
            answers(&[]),
            answers(&[("q", None)]),
            answers(&[("q", Some("   "))]),
        ] {
            let eval = evaluate(&doc, &case).unwrap();
            assert_eq!(eval.minor_count, 1, "case {case:?}");
            assert_eq!(
                eval.findings[0].minor_non_compliant_text.as_deref(),
                Some("Provide an answer.")
            );
            assert_eq!(eval.findings[0].major_non_compliant_text, None);
        }
        // Fixed score value is independent of the outcome.
        let eval = evaluate(&doc, &answers(&[("q", Some("yes"))])).unwrap();
        assert_eq!(eval.score_value.as_deref(), Some("10"));
    }

    #[test]
    fn in_op_respects_normalisation() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "answerNormalization": {"trim": true, "caseInsensitive": true, "emptyIsNull": true},
            "rules": [
                {"ruleId": "i1", "questionKey": "q",
                 "nonCompliantWhen": {"op": "in", "values": [" No ", "Refused"]},
                 "finding": {"severity": "Major", "message": "unacceptable answer"}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"majorCountGte": 1}, "outcome": "Fail"},
                                  {"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        assert_eq!(evaluate(&doc, &answers(&[("q", Some("no"))])).unwrap().outcome, "Fail");
        assert_eq!(
            evaluate(&doc, &answers(&[("q", Some("REFUSED "))])).unwrap().outcome,
            "Fail"
        );
        assert_eq!(evaluate(&doc, &answers(&[("q", Some("yes"))])).unwrap().outcome, "Pass");
        assert_eq!(evaluate(&doc, &answers(&[("q", None)])).unwrap().outcome, "Pass");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [
                {"ruleId": "off", "questionKey": "q", "enabled": false,
                 "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Major", "message": "never fires"}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        let eval = evaluate(&doc, &answers(&[])).unwrap();
        assert!(eval.findings.is_empty());
    }

    #[test]
    fn outcome_precedence_is_positional_and_defaults_to_unknown() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [
                {"ruleId": "m", "questionKey": "a", "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Major", "message": "a required"}},
                {"ruleId": "n", "questionKey": "b", "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Minor", "message": "b required"}}
            ],
            "scoring": {
                "outcomeRules": [
                    {"when": {"minorCountGte": 1}, "outcome": "Review"},
                    {"when": {"majorCountGte": 1}, "outcome": "Fail"}
                ],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        // Both counts are 1; the author put Review first, so Review wins.
        let eval = evaluate(&doc, &answers(&[])).unwrap();
        assert_eq!(eval.outcome, "Review");

        // Nothing matches when all answers are present.
        let eval = evaluate(&doc, &answers(&[("a", Some("x")), ("b", Some("y"))])).unwrap();
        assert_eq!(eval.outcome, "Unknown");
        assert_eq!(eval.score_value.as_deref(), Some("Unknown"));
    }

    #[test]
    fn evaluation_order_is_declaration_order() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [
                {"ruleId": "second-key", "questionKey": "z", "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Minor", "message": "z"}},
                {"ruleId": "first-key", "questionKey": "a", "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Minor", "message": "a"}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        let eval = evaluate(&doc, &answers(&[])).unwrap();
        let keys: Vec<_> = eval.findings.iter().map(|f| f.question_key.as_str()).collect();
        assert_eq!(keys, ["z", "a"]);
    }

    #[test]
    fn unknown_score_value_shapes_yield_null() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [],
            "scoring": {
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "lookup"}
            }
        }"#,
        );
        assert_eq!(evaluate(&doc, &answers(&[])).unwrap().score_value, None);

        // from=fixed with no fixedValue is also null.
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [],
            "scoring": {
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "numeric", "from": "fixed"}
            }
        }"#,
        );
        assert_eq!(evaluate(&doc, &answers(&[])).unwrap().score_value, None);
    }

    #[test]
    fn per_rule_overrides_beat_document_defaults() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "answerNormalization": {"trim": true, "caseInsensitive": true, "emptyIsNull": true},
            "rules": [
                {"ruleId": "exact", "questionKey": "q",
                 "nonCompliantWhen": {"op": "equals", "value": "No", "caseInsensitive": false, "trim": false},
                 "finding": {"severity": "Minor", "message": "exact match only"}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"minorCountGte": 1}, "outcome": "Review"},
                                  {"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        // The rule opts out of the document's trim + case folding.
        assert_eq!(evaluate(&doc, &answers(&[("q", Some("No"))])).unwrap().outcome, "Review");
        assert_eq!(evaluate(&doc, &answers(&[("q", Some("no"))])).unwrap().outcome, "Pass");
        assert_eq!(evaluate(&doc, &answers(&[("q", Some(" No "))])).unwrap().outcome, "Pass");
    }

    #[test]
    fn numeric_rule_values_compare_against_stringified_answers() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "rules": [
                {"ruleId": "n1", "questionKey": "strings",
                 "nonCompliantWhen": {"op": "equals", "value": 0},
                 "finding": {"severity": "Major", "message": "zero strings"}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"majorCountGte": 1}, "outcome": "Fail"},
                                  {"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        // Answers are persisted as strings; numeric rule values coerce the
        // same way before comparison.
        assert_eq!(evaluate(&doc, &answers(&[("strings", Some("0"))])).unwrap().outcome, "Fail");
        assert_eq!(evaluate(&doc, &answers(&[("strings", Some("2"))])).unwrap().outcome, "Pass");
    }

    #[test]
    fn empty_is_null_false_keeps_empty_strings() {
        let doc = doc_from(
            r#"{
            "ruleSetName": "T", "ruleSetVersion": "v1",
            "answerNormalization": {"trim": true, "caseInsensitive": false, "emptyIsNull": false},
            "rules": [
                {"ruleId": "m", "questionKey": "q", "nonCompliantWhen": {"op": "missing"},
                 "finding": {"severity": "Minor", "message": "required"}}
            ],
            "scoring": {
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"type": "text", "from": "outcome"}
            }
        }"#,
        );
        // Empty string survives normalisation but still counts as missing.
        let eval = evaluate(&doc, &answers(&[("q", Some(""))])).unwrap();
        assert_eq!(eval.minor_count, 1);
    }
}
