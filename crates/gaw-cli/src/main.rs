//! gaw entry point.
//!
//! One invocation runs one batch (the container scheduler owns the cadence).
//! The binary stays thin: tracing setup, settings, wiring, and exit-code
//! mapping live here; every behaviour belongs to the library crates.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use gaw_config::Settings;
use gaw_pipeline::{run_pipeline, PipelineDeps};
use gaw_remote::{
    ApiClient, EnvSecretProvider, RetryPolicy, SecretProvider, SystemClock, ThreadRngJitter,
    VaultSecretProvider,
};

#[derive(Parser)]
#[command(name = "gaw")]
#[command(about = "GoAudits integration workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline batch: ingest, enrich, score, outbox.
    Run,

    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Rule-document commands
    Rules {
        #[command(subcommand)]
        cmd: RulesCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum RulesCmd {
    /// Load and validate every rule document in a directory.
    Validate {
        /// Directory of {name}.{version}.json documents; defaults to RULES_DIR.
        #[arg(long)]
        dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent when the file
    // does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.cmd {
        Commands::Run => {
            settings.require_database()?;
            let bearer = bearer_token(&settings).await?;
            let pool = connect(&settings).await?;
            let client = ApiClient::new(RetryPolicy::default(), Arc::new(ThreadRngJitter))
                .map_err(|e| anyhow::anyhow!("http client: {e}"))?;

            let report = run_pipeline(PipelineDeps {
                pool,
                client,
                bearer,
                settings,
                clock: Arc::new(SystemClock),
            })
            .await?;

            println!("run_id={} succeeded={}", report.run_id, report.succeeded);
            println!("{}", report.summary);
            if !report.succeeded {
                bail!("pipeline run failed");
            }
        }

        Commands::Db { cmd } => {
            settings.require_database()?;
            let pool = connect(&settings).await?;
            match cmd {
                DbCmd::Status => {
                    let s = gaw_db::status(&pool).await?;
                    println!("db_ok={} has_watermark_table={}", s.ok, s.has_watermark_table);
                }
                DbCmd::Migrate => {
                    gaw_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Rules { cmd } => match cmd {
            RulesCmd::Validate { dir } => {
                let dir = dir
                    .map(std::path::PathBuf::from)
                    .unwrap_or_else(|| settings.rules_dir.clone());
                validate_rules_dir(&dir)?;
            }
        },
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// The GoAudits bearer token, freshly read each run. A configured secret
/// store wins; otherwise the environment-backed provider covers local runs.
async fn bearer_token(settings: &Settings) -> Result<String> {
    match &settings.secret_uri {
        Some(uri) => {
            VaultSecretProvider::new(uri.clone())?
                .get_secret(&settings.bearer_secret_name)
                .await
        }
        None => {
            EnvSecretProvider
                .get_secret(&settings.bearer_secret_name)
                .await
        }
    }
}

async fn connect(settings: &Settings) -> Result<gaw_db::PgPool> {
    if let Some(url) = &settings.database_url {
        return gaw_db::connect(url).await;
    }
    let host = settings.sql_host.as_deref().context("SQL_HOST missing")?;
    let db = settings.sql_db.as_deref().context("SQL_DB missing")?;
    let token = gaw_remote::ambient_database_token()
        .await
        .context("database access token unavailable")?;
    gaw_db::connect_with_token(host, db, &token).await
}

/// Validate every `{name}.{version}.json` in `dir`; print one line per file.
fn validate_rules_dir(dir: &std::path::Path) -> Result<()> {
    let mut checked = 0usize;
    let mut failed = 0usize;

    let entries =
        std::fs::read_dir(dir).with_context(|| format!("read rules dir {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((name, version)) = stem.split_once('.') else {
            println!("{}: skipped (expected {{name}}.{{version}}.json)", path.display());
            continue;
        };
        checked += 1;
        match gaw_rules::load_document(dir, name, version) {
            Ok(doc) => println!(
                "{}: ok ({} rules, {} outcome rules)",
                path.display(),
                doc.rules.len(),
                doc.scoring.outcome_rules.len()
            ),
            Err(err) => {
                failed += 1;
                println!("{}: invalid: {err}", path.display());
            }
        }
    }

    println!("checked={checked} failed={failed}");
    if failed > 0 {
        bail!("{failed} rule document(s) failed validation");
    }
    Ok(())
}
