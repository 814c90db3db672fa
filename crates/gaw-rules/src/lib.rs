//! Versioned scoring rule sets: documents, evaluation, and resolution.
//!
//! A rule set is an immutable named, versioned collection of rules plus
//! outcome and scoring configuration. Documents are loaded from JSON files,
//! validated, and cached for the process lifetime; evaluation is a pure
//! function over a document and an answer map; resolution decides which
//! document applies to a report.

pub mod document;
pub mod evaluator;
pub mod resolver;

pub use document::{
    cached_document, load_document, FindingSpec, Normalization, OutcomeRule, OutcomeWhen, Rule,
    RuleCondition, RuleDocError, RuleDocument, Scoring, ScoreValueSpec, Severity,
};
pub use evaluator::{evaluate, value_to_answer_string, EvaluatedFinding, Evaluation};
pub use resolver::{resolve_ruleset, CatalogEntry, Resolution, RulesetCatalog};
