//! PolicyEngine client CLI
//!
//! Offline and online access to the client core:
//! - Encoding a policy into a share query, and decoding one back
//! - Validating a location and household against a metadata snapshot on disk
//! - Loading live metadata from the API and printing the published state

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use policyengine_reconcile::{
    decode_policy, validate_policy, ClientConfig, EditOutcome, HttpMetadataSource,
    MetadataSource, RawPolicy, ReconciliationOrchestrator, StaticMetadataSource,
    ValidationIssue,
};
use policyengine_schema::CountryProfile;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "policyengine")]
#[command(author, version, about = "PolicyEngine client core: policies, households and share links")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a policy (JSON object of id → value) as a share query.
    ///
    /// The policy is validated first, so only values that differ from the
    /// defaults are written.
    Encode {
        /// Policy JSON, or `@path` to read it from a file
        #[arg(long)]
        policy: String,
        #[command(flatten)]
        snapshot: SnapshotArgs,
        /// Print a full `path?query` link instead of the bare query
        #[arg(long)]
        path: Option<String>,
    },

    /// Decode a query, share link or location into raw JSON.
    Decode {
        /// Query or location, e.g. `/uk/policy?tax.rate=0.25`
        query: String,
    },

    /// Validate a location and household against a metadata snapshot.
    Validate {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        #[command(flatten)]
        input: InputArgs,
    },

    /// Fetch live metadata and print the reconciled state.
    Load {
        /// Country profile JSON
        #[arg(long)]
        profile: PathBuf,
        /// API base URL (defaults to the profile's, then POLICYENGINE_API_URL)
        #[arg(long)]
        api_url: Option<String>,
        #[command(flatten)]
        input: InputArgs,
    },
}

#[derive(Args)]
struct SnapshotArgs {
    /// Country profile JSON
    #[arg(long)]
    profile: PathBuf,
    /// Directory holding parameters.json, variables.json, entities.json
    #[arg(long)]
    metadata: PathBuf,
}

#[derive(Args)]
struct InputArgs {
    /// Page location whose query carries the policy
    #[arg(long, default_value = "/")]
    location: String,
    /// Household JSON replacing the profile's default situation
    #[arg(long)]
    situation: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Encode {
            policy,
            snapshot,
            path,
        } => cmd_encode(&policy, &snapshot, path.as_deref()).await,
        Commands::Decode { query } => cmd_decode(&query),
        Commands::Validate { snapshot, input } => cmd_validate(&snapshot, &input).await,
        Commands::Load {
            profile,
            api_url,
            input,
        } => cmd_load(&profile, api_url, &input).await,
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_encode(policy: &str, snapshot: &SnapshotArgs, path: Option<&str>) -> Result<()> {
    let raw: RawPolicy = serde_json::from_str(&read_arg(policy)?)
        .context("policy must be a JSON object of parameter id → value")?;
    let orch = reconcile_snapshot(snapshot, "/").await?;
    let schema = orch
        .schema()
        .ok_or_else(|| anyhow!("metadata snapshot did not produce a schema"))?;

    let validated = validate_policy(&raw, schema, &orch.profile().parameter_renames);
    report_issues(&validated.issues);
    match path {
        Some(path) => println!("{}", policyengine_reconcile::policy_url(path, &validated.policy)),
        None => println!("{}", policyengine_reconcile::encode_policy(&validated.policy)),
    }
    Ok(())
}

fn cmd_decode(query: &str) -> Result<()> {
    let raw = decode_policy(query);
    println!("{}", serde_json::to_string_pretty(&raw)?);
    Ok(())
}

async fn cmd_validate(snapshot: &SnapshotArgs, input: &InputArgs) -> Result<()> {
    let mut orch = reconcile_snapshot(snapshot, &input.location).await?;
    apply_situation(&mut orch, input.situation.as_deref())?;
    print_state(&orch)
}

async fn cmd_load(profile: &Path, api_url: Option<String>, input: &InputArgs) -> Result<()> {
    let profile = load_profile(profile)?;
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = api_url.or_else(|| profile.api_url.clone()) {
        config = config.with_api_url(url)?;
    }
    eprintln!(
        "{} {} from {}",
        "Loading".green().bold(),
        profile.name.bold(),
        config.api_url
    );

    let source: Arc<dyn MetadataSource> = Arc::new(HttpMetadataSource::new(config.clone())?);
    let mut orch = ReconciliationOrchestrator::new(profile, input.location.clone());
    orch.load(source, &config)
        .await
        .context("loading metadata from the API")?;
    apply_situation(&mut orch, input.situation.as_deref())?;
    print_state(&orch)
}

// ============================================================================
// Helpers
// ============================================================================

fn load_profile(path: &Path) -> Result<CountryProfile> {
    CountryProfile::from_path(path).with_context(|| format!("reading profile {}", path.display()))
}

async fn reconcile_snapshot(
    snapshot: &SnapshotArgs,
    location: &str,
) -> Result<ReconciliationOrchestrator> {
    let profile = load_profile(&snapshot.profile)?;
    let source = StaticMetadataSource::from_dir(&snapshot.metadata)
        .with_context(|| format!("reading metadata from {}", snapshot.metadata.display()))?;
    let config = ClientConfig::default().with_retries(0, 0);

    let mut orch = ReconciliationOrchestrator::new(profile, location);
    orch.load(Arc::new(source), &config)
        .await
        .context("reconciling metadata snapshot")?;
    Ok(orch)
}

fn apply_situation(orch: &mut ReconciliationOrchestrator, path: Option<&Path>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading situation {}", path.display()))?;
    let situation: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing situation {}", path.display()))?;
    match orch.edit_situation(situation) {
        EditOutcome::Rejected { reason } => Err(anyhow!(reason)),
        _ => Ok(()),
    }
}

fn print_state(orch: &ReconciliationOrchestrator) -> Result<()> {
    let state = orch.state();
    report_issues(&state.issues);
    if let Some(query) = orch.share_query().filter(|q| !q.is_empty()) {
        eprintln!("{} {}", "share".green().bold(), query);
    }
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

fn report_issues(issues: &[ValidationIssue]) {
    for issue in issues {
        eprintln!(
            "{} {} {}",
            "warning:".yellow().bold(),
            issue.identifier.bold(),
            issue.message
        );
    }
    if !issues.is_empty() {
        eprintln!("  {} {} issue(s)", "→".yellow(), issues.len());
    }
}

/// `@path` reads the file; anything else is taken literally.
fn read_arg(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {}", path)),
        None => Ok(arg.to_string()),
    }
}
