use alloy::primitives::Address;
use anyhow::{anyhow, Context, Result};
use comet_spider::artifact::etherscan::EtherscanSource;
use comet_spider::artifact::ArtifactSource;
use comet_spider::chain::rpc::RpcChainReader;
use comet_spider::config::settings::SpiderSettings;
use comet_spider::deployment::{DeploymentFiles, DeploymentManager};
use comet_spider::storage::artifact_db::ArtifactDb;
use comet_spider::utils::env_guard::load_dot_env;
use comet_spider::utils::hex::{address_key, parse_address};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
struct Args {
    network: String,
    deployment: String,
    write: bool,
    load_only: bool,
    deployments_dir: Option<PathBuf>,
    rpc_url: Option<String>,
    invalidate: Vec<Address>,
}

fn print_usage() {
    eprintln!(
        "usage: spider --network <name> --deployment <name> [--write] [--load]\n\
         \x20             [--deployments-dir <dir>] [--rpc-url <url>] [--invalidate <0x...>]...\n\
         env: <NETWORK>_RPC_URL or ETH_RPC_URL, ETHERSCAN_API_KEY, SPIDER_ARTIFACT_DB,\n\
         \x20    SPIDER_DEPLOYMENTS_DIR, SPIDER_MAX_IN_FLIGHT, SPIDER_RPC_RETRIES, RPC_CALL_TIMEOUT_MS"
    );
}

fn parse_args() -> Result<Args> {
    let mut network: Option<String> = None;
    let mut deployment: Option<String> = None;
    let mut write = false;
    let mut load_only = false;
    let mut deployments_dir: Option<PathBuf> = None;
    let mut rpc_url: Option<String> = None;
    let mut invalidate = Vec::new();

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--network" | "-n" => {
                network = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("missing value for {arg}"))?,
                );
            }
            "--deployment" | "-d" => {
                deployment = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("missing value for {arg}"))?,
                );
            }
            "--write" | "-w" => write = true,
            "--load" => load_only = true,
            "--deployments-dir" => {
                deployments_dir = Some(PathBuf::from(
                    iter.next()
                        .ok_or_else(|| anyhow!("missing value for {arg}"))?,
                ));
            }
            "--rpc-url" | "-r" => {
                rpc_url = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("missing value for {arg}"))?,
                );
            }
            "--invalidate" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| anyhow!("missing value for {arg}"))?;
                invalidate.push(parse_address(&raw)?);
            }
            other => return Err(anyhow!("unknown argument '{other}'")),
        }
    }

    Ok(Args {
        network: network.ok_or_else(|| anyhow!("--network is required"))?,
        deployment: deployment.ok_or_else(|| anyhow!("--deployment is required"))?,
        write,
        load_only,
        deployments_dir,
        rpc_url,
        invalidate,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args().inspect_err(|_| print_usage())?;
    load_dot_env(Path::new(".env"));

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = SpiderSettings::load(&args.network)?;
    if let Some(dir) = args.deployments_dir.clone() {
        settings.deployments_dir = dir;
    }
    if let Some(url) = args.rpc_url.clone() {
        settings.rpc_url = Some(url);
    }

    let artifact_db = ArtifactDb::open(&settings.artifact_db_path).with_context(|| {
        format!(
            "failed to open artifact cache {}",
            settings.artifact_db_path.display()
        )
    })?;
    let source: Option<Arc<dyn ArtifactSource>> = match settings.etherscan_api_key.clone() {
        Some(key) => Some(Arc::new(EtherscanSource::new(key))),
        None => {
            tracing::warn!("[SPIDER] ETHERSCAN_API_KEY unset; only cached artifacts are usable");
            None
        }
    };
    let manager = DeploymentManager::new(
        DeploymentFiles::new(settings.deployments_dir.clone()),
        Some(artifact_db),
        source,
    )
    .with_max_in_flight(settings.max_in_flight);

    let artifacts = manager.artifacts(settings.network.name);
    for address in &args.invalidate {
        let removed = artifacts.invalidate(*address)?;
        tracing::info!(
            "[ARTIFACT] invalidate {:#x}: {}",
            address,
            if removed { "removed" } else { "not cached" }
        );
    }

    let deployment = if args.load_only {
        manager
            .load(settings.network.name, &args.deployment)
            .with_context(|| format!("failed to load {}/{}", args.network, args.deployment))?
    } else {
        let rpc_url = settings.require_rpc_url()?;
        let reader = RpcChainReader::connect(rpc_url, settings.max_in_flight, settings.retry)?;
        manager
            .spider(settings.network.name, &args.deployment, &reader, args.write)
            .await
            .with_context(|| format!("failed to spider {}/{}", args.network, args.deployment))?
    };

    let rendered: BTreeMap<String, String> = deployment
        .aliases()
        .into_iter()
        .map(|(alias, address)| (alias, address_key(address)))
        .collect();
    println!("{}", serde_json::to_string_pretty(&rendered)?);

    if !deployment.errors.is_empty() {
        eprintln!(
            "[SPIDER] {} node(s) unresolved; see {}",
            deployment.errors.len(),
            if args.write {
                "unresolved.json"
            } else {
                "the log above"
            }
        );
    }
    Ok(())
}
