//! dray-pull
//!
//! Pulls one or more images into the local store and prints their image
//! IDs. With `--inspect` it only fetches manifests and configs and prints
//! what the registry reports.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dray_distribution::progress::TracingProgress;
use dray_distribution::{inspect, Config, Digest, ImageService, Platform, PullConfig, Reference};

/// Pull container images from a registry.
#[derive(Debug, Parser)]
#[command(name = "dray-pull")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Platform to select from multi-platform images (os/arch).
    #[arg(long, env = "DRAY_PLATFORM")]
    platform: Option<String>,

    /// Never fall back to legacy v1 endpoints.
    #[arg(long)]
    require_schema2: bool,

    /// Registry reachable over plaintext or unverified TLS. Repeatable.
    #[arg(long = "insecure-registry", value_name = "HOST")]
    insecure_registries: Vec<String>,

    /// Pull-through mirror for Docker Hub. Repeatable.
    #[arg(long = "mirror", value_name = "URL")]
    mirrors: Vec<String>,

    /// Print results as JSON and log as JSON.
    #[arg(long)]
    json: bool,

    /// Only fetch manifest and config, and print them.
    #[arg(long)]
    inspect: bool,

    /// Image references to pull.
    #[arg(required = true)]
    references: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        config.require_schema2 |= self.require_schema2;
        config
            .insecure_registries
            .extend(self.insecure_registries.iter().cloned());
        config.mirrors.extend(self.mirrors.iter().cloned());
    }
}

#[derive(Debug, Serialize)]
struct PullSummary {
    reference: String,
    id: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<Digest>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    cli.apply(&mut config);

    init_tracing(&config.log_level, cli.json);

    let references = cli
        .references
        .iter()
        .map(|r| {
            r.parse::<Reference>()
                .with_context(|| format!("invalid reference {}", r))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut pull_config = config
        .pull_config()
        .await?
        .with_progress(Arc::new(TracingProgress));
    if let Some(platform) = &cli.platform {
        let platform =
            Platform::parse(platform).ok_or_else(|| anyhow!("invalid platform {}", platform))?;
        pull_config = pull_config.with_platform(platform);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                cancel.cancel();
            }
        }
    });

    let failed = if cli.inspect {
        run_inspect(&references, &pull_config, &cancel, cli.json).await?
    } else {
        run_pull(&references, pull_config, &cancel, cli.json).await?
    };

    if failed > 0 {
        anyhow::bail!("{} of {} references failed", failed, references.len());
    }
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().pretty()))
        .init();
}

/// Pull every reference concurrently. Returns the number of failures.
async fn run_pull(
    references: &[Reference],
    config: PullConfig,
    cancel: &CancellationToken,
    json: bool,
) -> Result<usize> {
    let service = ImageService::new(config);
    let results = join_all(
        references
            .iter()
            .map(|reference| service.pull_and_store(reference, cancel)),
    )
    .await;

    let mut failed = 0;
    for (reference, result) in references.iter().zip(results) {
        match result {
            Ok(record) => {
                if json {
                    let summary = PullSummary {
                        reference: record.reference.to_string(),
                        id: record.id,
                        digest: record.manifest_digest,
                    };
                    println!("{}", serde_json::to_string(&summary)?);
                } else {
                    println!("{}", record.id);
                }
            }
            Err(e) => {
                error!(reference = %reference, error = %e, "pull failed");
                failed += 1;
            }
        }
    }
    Ok(failed)
}

async fn run_inspect(
    references: &[Reference],
    config: &PullConfig,
    cancel: &CancellationToken,
    json: bool,
) -> Result<usize> {
    let results = join_all(
        references
            .iter()
            .map(|reference| inspect(reference, config, cancel)),
    )
    .await;

    let mut failed = 0;
    for (reference, result) in references.iter().zip(results) {
        match result {
            Ok(image) => {
                if json {
                    println!("{}", serde_json::to_string(&image)?);
                } else {
                    println!("{}", serde_json::to_string_pretty(&image)?);
                }
            }
            Err(e) => {
                error!(reference = %reference, error = %e, "inspect failed");
                failed += 1;
            }
        }
    }
    Ok(failed)
}
