//! Runs a program on an MPC cluster, paying for every step.
use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use mpc_paygate::{
    ClientConfig, ClusterClient,
    program::ProgramArtifact,
    values::SecretBundle,
    workflow::{DEFAULT_PARTY_NAME, Workflow},
};
use mpc_paygate_http::{HttpCluster, HttpLedger};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};
use url::Url;

/// Stores a compiled program and its inputs on an MPC cluster, runs it and prints the result
/// as JSON.
///
/// The cluster id, the payment chain and the identity seed are read from the `MPC_CLUSTER_ID`,
/// `MPC_CHAIN_ID`, `MPC_CHAIN_GRPC`, `MPC_CHAIN_PRIVATE_KEY` and `MPC_SEED` environment
/// variables.
///
/// Logging can be controlled with an EnvFilter via the `MPC_PAYGATE_LOG` environment variable.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Base url of the cluster API.
    #[arg(long, env = "MPC_CLUSTER_URL")]
    cluster_url: Url,
    /// The compiled program.
    #[arg(long)]
    program: PathBuf,
    /// Name to store the program under. Defaults to the file name without extensions.
    #[arg(long)]
    name: Option<String>,
    /// JSON file with a bundle of input values. Can be repeated.
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,
    /// Retention of inputs which do not specify a TTL.
    #[arg(long, default_value_t = 5)]
    ttl_days: u32,
    /// The name under which the program knows this party.
    #[arg(long, default_value = DEFAULT_PARTY_NAME)]
    party_name: String,
    /// Seconds to wait for the result.
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().context("tracing initialization")?;

    let cli = Cli::parse();
    let config = ClientConfig::from_env().context("reading configuration")?;
    let cluster = HttpCluster::new(cli.cluster_url.clone())?;
    let ledger = HttpLedger::new(config.grpc_endpoint.clone())?;
    let client = ClusterClient::new(&config, cluster, ledger)?;

    let artifact = ProgramArtifact::read(&cli.program)
        .await
        .with_context(|| format!("reading program {}", cli.program.display()))?;
    let name = match cli.name {
        Some(name) => name,
        None => program_name(&cli.program)?,
    };
    let mut workflow = Workflow::new(name, artifact).party_name(cli.party_name);
    for path in &cli.inputs {
        let json = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading input {}", path.display()))?;
        let mut bundle: SecretBundle = serde_json::from_slice(&json)
            .with_context(|| format!("parsing input {}", path.display()))?;
        if bundle.ttl_days().is_none() {
            bundle = bundle.with_ttl_days(cli.ttl_days);
        }
        workflow = workflow.input(bundle);
    }
    if let Some(secs) = cli.timeout {
        workflow = workflow.deadline(Duration::from_secs(secs));
    }

    let output = workflow.run(&client).await.map_err(|err| {
        if let Some(tx_hash) = err.charged() {
            tracing::error!(%tx_hash, "flow failed after a settled payment");
        }
        err
    })?;
    info!(compute_id = %output.compute_id, "done");
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn program_name(path: &std::path::Path) -> anyhow::Result<String> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("program path has no valid file name")?;
    let name = file_name.split('.').next().unwrap_or(file_name);
    Ok(name.to_string())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_env_var("MPC_PAYGATE_LOG")
        .with_default_directive("mpc_paygate=info".parse()?)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
