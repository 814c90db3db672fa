//! Environment-driven settings for the GoAudits workers.
//!
//! All configuration is read once at startup into [`Settings`]. The parsing
//! core is `Settings::from_map`, which never touches process state, so tests
//! can exercise every code path without mutating environment variables.
//! Unrecognised variables are ignored.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Default GoAudits endpoint returning completed-audit summaries.
pub const DEFAULT_SUMMARY_URL: &str = "https://api.goaudits.com/v1/audits/summary";
/// Default GoAudits endpoint returning per-audit detail rows.
pub const DEFAULT_DETAILS_URL: &str = "https://api.goaudits.com/v1/audits/detail";
/// Default secret name holding the GoAudits bearer token.
pub const DEFAULT_BEARER_SECRET_NAME: &str = "goaudits-bearer-token";
/// Default ruleset version map, overridable via `RULESET_MAP_JSON`.
pub const DEFAULT_RULESET_MAP_JSON: &str = r#"{"PV":"v2","HeatPump":"v3"}"#;

/// Scope of the outbox materialisation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialiseScope {
    /// Every score without an outbox row.
    All,
    /// Only the reports touched by the current batch.
    Batch,
}

impl MaterialiseScope {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(MaterialiseScope::All),
            "batch" => Ok(MaterialiseScope::Batch),
            other => bail!("invalid MATERIALISE_SCOPE '{}'. expected all | batch", other),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Summary endpoint (POST).
    pub summary_url: String,
    /// Details endpoint (POST).
    pub details_url: String,
    /// Database host (`SQL_HOST`); unused when `database_url` is set.
    pub sql_host: Option<String>,
    /// Database name (`SQL_DB`); unused when `database_url` is set.
    pub sql_db: Option<String>,
    /// Full connection URL override (`GAW_DATABASE_URL`), for tests and dev.
    pub database_url: Option<String>,
    /// Secret store base URI.
    pub secret_uri: Option<String>,
    /// Name of the secret holding the GoAudits bearer token.
    pub bearer_secret_name: String,
    /// Maximum new items per run, before tie expansion.
    pub batch_size: usize,
    /// Optional lower-bound override for ingestion.
    pub start_date: Option<DateTime<Utc>>,
    /// Optional upper bound; date-only values are promoted to end-of-day.
    pub end_date: Option<DateTime<Utc>>,
    /// Ruleset name -> version, from `RULESET_MAP_JSON`.
    pub ruleset_versions: BTreeMap<String, String>,
    /// Diagnostic: no mutating SQL.
    pub dry_run: bool,
    /// Diagnostic: re-derive question keys and warn on instability.
    pub validate_keys: bool,
    /// Whether to materialise the email outbox at the end of a run.
    pub materialise_email: bool,
    /// Materialisation scope.
    pub materialise_scope: MaterialiseScope,
    /// Directory holding `{name}.{version}.json` rule documents.
    pub rules_dir: PathBuf,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// Call `dotenvy::from_filename(".env.local")` first if dev-file loading
    /// is wanted; this function reads whatever is currently set.
    pub fn from_env() -> Result<Self> {
        let map: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_map(&map)
    }

    /// Parse settings from an explicit key/value map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let get = |k: &str| map.get(k).map(|s| s.trim()).filter(|s| !s.is_empty());

        let batch_size = match get("BATCH_SIZE") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid BATCH_SIZE '{raw}'"))?,
            None => 50,
        };
        if batch_size == 0 {
            bail!("BATCH_SIZE must be at least 1");
        }

        let start_date = get("START_DATE")
            .map(|raw| parse_instant(raw, BoundKind::Start))
            .transpose()
            .context("invalid START_DATE")?;
        let end_date = get("END_DATE")
            .map(|raw| parse_instant(raw, BoundKind::End))
            .transpose()
            .context("invalid END_DATE")?;
        if let (Some(s), Some(e)) = (start_date, end_date) {
            if e < s {
                bail!("END_DATE {} precedes START_DATE {}", e, s);
            }
        }

        let ruleset_versions =
            parse_ruleset_map(get("RULESET_MAP_JSON").unwrap_or(DEFAULT_RULESET_MAP_JSON))?;

        let materialise_scope = match get("MATERIALISE_SCOPE") {
            Some(raw) => MaterialiseScope::parse(raw)?,
            None => MaterialiseScope::All,
        };

        Ok(Settings {
            summary_url: get("SUMMARY_URL").unwrap_or(DEFAULT_SUMMARY_URL).to_string(),
            details_url: get("DETAILS_URL").unwrap_or(DEFAULT_DETAILS_URL).to_string(),
            sql_host: get("SQL_HOST").map(str::to_string),
            sql_db: get("SQL_DB").map(str::to_string),
            database_url: get("GAW_DATABASE_URL").map(str::to_string),
            secret_uri: get("SECRET_URI").map(str::to_string),
            bearer_secret_name: get("BEARER_SECRET_NAME")
                .unwrap_or(DEFAULT_BEARER_SECRET_NAME)
                .to_string(),
            batch_size,
            start_date,
            end_date,
            ruleset_versions,
            dry_run: parse_bool(get("DRYRUN"))?,
            validate_keys: parse_bool(get("VALIDATE_KEYS"))?,
            materialise_email: parse_bool(get("MATERIALISE_EMAIL"))?,
            materialise_scope,
            rules_dir: PathBuf::from(get("RULES_DIR").unwrap_or("./rules")),
        })
    }

    /// The database must be reachable either via a full URL or host + name.
    pub fn require_database(&self) -> Result<()> {
        if self.database_url.is_none() && (self.sql_host.is_none() || self.sql_db.is_none()) {
            bail!("database endpoint missing: set GAW_DATABASE_URL, or SQL_HOST and SQL_DB");
        }
        Ok(())
    }
}

enum BoundKind {
    Start,
    End,
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS` (assumed UTC), or a bare date.
/// Bare dates become start-of-day for lower bounds and end-of-day for upper
/// bounds.
fn parse_instant(raw: &str, kind: BoundKind) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let naive = match kind {
            BoundKind::Start => date.and_hms_opt(0, 0, 0),
            BoundKind::End => date.and_hms_opt(23, 59, 59),
        };
        // and_hms_opt only fails for out-of-range components; these are fixed.
        let naive = naive.context("date out of range")?;
        return Ok(naive.and_utc());
    }
    bail!("unrecognised instant '{raw}'. expected ISO date-time or YYYY-MM-DD")
}

fn parse_bool(raw: Option<&str>) -> Result<bool> {
    let Some(raw) = raw else { return Ok(false) };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("invalid boolean '{other}'. expected true | false"),
    }
}

fn parse_ruleset_map(raw: &str) -> Result<BTreeMap<String, String>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("RULESET_MAP_JSON must be valid JSON")?;
    let obj = value
        .as_object()
        .context("RULESET_MAP_JSON must be a JSON object of name -> version")?;
    let mut out = BTreeMap::new();
    for (name, version) in obj {
        let version = version
            .as_str()
            .with_context(|| format!("RULESET_MAP_JSON['{name}'] must be a string"))?;
        if version.trim().is_empty() {
            bail!("RULESET_MAP_JSON['{name}'] is empty");
        }
        out.insert(name.clone(), version.trim().to_string());
    }
    if out.is_empty() {
        bail!("RULESET_MAP_JSON must name at least one ruleset");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("SQL_HOST".to_string(), "db.internal".to_string()),
            ("SQL_DB".to_string(), "audits".to_string()),
        ])
    }

    #[test]
    fn defaults_apply() {
        let s = Settings::from_map(&base_env()).unwrap();
        assert_eq!(s.batch_size, 50);
        assert_eq!(s.summary_url, DEFAULT_SUMMARY_URL);
        assert_eq!(s.bearer_secret_name, DEFAULT_BEARER_SECRET_NAME);
        assert!(!s.dry_run);
        assert_eq!(s.materialise_scope, MaterialiseScope::All);
        assert_eq!(s.ruleset_versions.get("PV").map(String::as_str), Some("v2"));
        assert_eq!(
            s.ruleset_versions.get("HeatPump").map(String::as_str),
            Some("v3")
        );
    }

    #[test]
    fn date_only_end_is_end_of_day() {
        let mut env = base_env();
        env.insert("START_DATE".into(), "2024-08-01".into());
        env.insert("END_DATE".into(), "2024-08-02".into());
        let s = Settings::from_map(&env).unwrap();
        assert_eq!(
            s.start_date.unwrap().to_rfc3339(),
            "2024-08-01T00:00:00+00:00"
        );
        assert_eq!(s.end_date.unwrap().to_rfc3339(), "2024-08-02T23:59:59+00:00");
    }

    #[test]
    fn full_timestamps_accepted() {
        let mut env = base_env();
        env.insert("START_DATE".into(), "2024-08-01T10:30:00Z".into());
        let s = Settings::from_map(&env).unwrap();
        assert_eq!(
            s.start_date.unwrap().to_rfc3339(),
            "2024-08-01T10:30:00+00:00"
        );
    }

    #[test]
    fn end_before_start_rejected() {
        let mut env = base_env();
        env.insert("START_DATE".into(), "2024-08-02".into());
        env.insert("END_DATE".into(), "2024-08-01".into());
        assert!(Settings::from_map(&env).is_err());
    }

    #[test]
    fn bool_flags_parse() {
        let mut env = base_env();
        env.insert("DRYRUN".into(), "TRUE".into());
        env.insert("MATERIALISE_EMAIL".into(), "yes".into());
        let s = Settings::from_map(&env).unwrap();
        assert!(s.dry_run);
        assert!(s.materialise_email);

        env.insert("DRYRUN".into(), "maybe".into());
        assert!(Settings::from_map(&env).is_err());
    }

    #[test]
    fn ruleset_map_override() {
        let mut env = base_env();
        env.insert("RULESET_MAP_JSON".into(), r#"{"PV":"v9"}"#.into());
        let s = Settings::from_map(&env).unwrap();
        assert_eq!(s.ruleset_versions.get("PV").map(String::as_str), Some("v9"));
        assert!(!s.ruleset_versions.contains_key("HeatPump"));

        env.insert("RULESET_MAP_JSON".into(), r#"{"PV":2}"#.into());
        assert!(Settings::from_map(&env).is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut env = base_env();
        env.insert("BATCH_SIZE".into(), "0".into());
        assert!(Settings::from_map(&env).is_err());
    }

    #[test]
    fn missing_database_detected() {
        let s = Settings::from_map(&BTreeMap::new()).unwrap();
        assert!(s.require_database().is_err());

        let mut env = BTreeMap::new();
        env.insert(
            "GAW_DATABASE_URL".into(),
            "postgres://u@localhost/gaw".into(),
        );
        let s = Settings::from_map(&env).unwrap();
        assert!(s.require_database().is_ok());
    }
}
