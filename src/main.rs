use crate::chart::Chart;
use crate::extractor::{Extractor, MAX_WORKERS, ScanCache};
use crate::output::OutputFormat;
use crate::policy::PolicyChain;
use crate::renderer::{HelmRenderer, render_all};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod chart;
mod config;
mod extractor;
mod image_reference;
mod manifest_scanner;
mod operator;
mod output;
mod policy;
mod renderer;
mod values;
mod values_scanner;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Extracts the container images referenced by a set of Helm charts.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file listing the charts to scan
    #[arg(short, long, env = "HELM_IMAGE_EXTRACTOR_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Output file, overrides `output.path`
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format, overrides `output.format`
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Number of render and scan workers (1-32)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Skip `helm template` and scan chart values only
    #[arg(long)]
    no_render: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    debug: bool,
}

fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    info!("Starting helm-image-extractor {}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&cli.config)?;
    if let Some(output) = cli.output {
        config.output.path = output;
    }
    if let Some(format) = cli.format {
        config.output.format = format;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.no_render {
        config.render.enabled = false;
    }
    let workers = config.workers.clamp(1, MAX_WORKERS);

    let operators = config.operator_config()?;
    let policy = PolicyChain::from_config(&config.policy)?;

    let charts: Vec<Arc<Chart>> = chart::load_charts(&config.charts, &config.base_dir)
        .into_iter()
        .map(Arc::new)
        .collect();
    info!("Loaded {} of {} charts", charts.len(), config.charts.len());

    let results = if config.render.enabled {
        let renderer = HelmRenderer {
            helm_binary: config.render.helm_binary.clone(),
            namespace: config.render.namespace.clone(),
            kube_version: config.render.kube_version.clone(),
            timeout: config.render.timeout(),
        };
        render_all(&renderer, &charts, workers).await
    } else {
        info!("Rendering disabled, scanning chart values only");
        Vec::new()
    };

    let mut extractor = Extractor::new(operators, workers, config.max_depth);
    if config.cache {
        extractor = extractor.with_cache(Arc::new(ScanCache::default()));
    }
    let candidates = extractor.extract(results, &charts).await;
    let images = policy.apply(candidates);

    output::write_images(&images, &config.output.path, config.output.format)?;
    println!(
        "{} images written to {}",
        images.len(),
        config.output.path.display()
    );

    Ok(())
}
