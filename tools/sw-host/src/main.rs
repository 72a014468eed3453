//! Command-line host for the TurboScout offline cache worker.
//!
//! Runs the worker against a live deployment with the cache stores persisted on disk, so a
//! generation can be installed, exercised offline, and inspected without a browser.
//!
//! ## Usage
//!
//! ```bash
//! # Install and activate the configured generation
//! sw-host --scope https://scout.example/ install
//!
//! # Serve a navigation with the network unplugged
//! sw-host fetch /scout --navigate --offline
//!
//! # List persisted generations
//! sw-host caches
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use turboscout_common::{init_logging, LogConfig, LogFormat};
use turboscout_net::{Fetcher, HttpFetcher, LoaderConfig, OfflineFetcher, Request};
use turboscout_sw::{
    CacheStorage, CacheWorker, Deployment, HostConfig, PageContext, Registrar, RegistrarOutcome,
    ServiceWorkerContainer, ServiceWorkerState,
};
use url::Url;

#[derive(Parser)]
#[command(name = "sw-host")]
#[command(about = "Run the TurboScout offline cache worker outside the browser")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory the cache stores are persisted to
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Override the registration scope
    #[arg(long, global = true)]
    scope: Option<Url>,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: Level,

    /// Log output: pretty, compact, or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Filter directives, e.g. `turboscout_sw=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the configured generation
    Install,

    /// Serve one request through the active generation
    Fetch {
        /// URL or path relative to the scope
        url: String,
        /// Treat the request as a navigation
        #[arg(long)]
        navigate: bool,
        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Act as if the network is down
        #[arg(long)]
        offline: bool,
        /// Give up on the network after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List persisted cache generations
    Caches,

    /// Delete stale generations without installing
    Prune,
}

/// Reloads are the browser's business; here they are only reported.
struct ConsolePage;

impl PageContext for ConsolePage {
    fn reload(&self) {
        info!("Page reload requested");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(
        &LogConfig::default()
            .with_level(cli.log_level)
            .with_format(cli.log_format)
            .with_directives(cli.log_filter.clone()),
    )?;

    let config = load_config(&cli)?;
    let cache_dir = config
        .worker
        .cache_dir
        .clone()
        .context("no cache directory configured")?;

    match cli.command {
        Commands::Install => install(&config, &cache_dir).await,
        Commands::Fetch {
            url,
            navigate,
            method,
            offline,
            timeout,
        } => {
            let options = FetchOptions {
                navigate,
                method,
                offline,
                timeout: timeout.map(Duration::from_secs),
            };
            fetch(&config, &cache_dir, &url, &options).await
        }
        Commands::Caches => list_caches(&config, &cache_dir).await,
        Commands::Prune => prune(&config, &cache_dir).await,
    }
}

fn load_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };

    if let Some(scope) = &cli.scope {
        config.worker.scope = scope.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.worker.cache_dir = Some(dir.clone());
    }
    if config.worker.cache_dir.is_none() {
        config.worker.cache_dir = dirs::cache_dir().map(|dir| dir.join("turboscout"));
    }

    config.worker.validate()?;
    Ok(config)
}

fn script_url(config: &HostConfig) -> Result<Url> {
    Ok(config.worker.scope.join(&config.registrar.script_path)?)
}

fn network() -> Result<Arc<dyn Fetcher>> {
    Ok(Arc::new(HttpFetcher::new(LoaderConfig::default())?))
}

async fn container(
    config: &HostConfig,
    cache_dir: &Path,
    network: Arc<dyn Fetcher>,
) -> Result<(ServiceWorkerContainer, CacheStorage)> {
    let caches = CacheStorage::open_dir(cache_dir)
        .await
        .with_context(|| format!("opening cache storage at {}", cache_dir.display()))?;
    let deployment = Deployment::new(config.worker.clone(), caches.clone(), network.clone());
    let container =
        ServiceWorkerContainer::new(config.worker.scope.clone(), Arc::new(deployment), network);
    Ok((container, caches))
}

async fn install(config: &HostConfig, cache_dir: &Path) -> Result<()> {
    let (container, caches) = container(config, cache_dir, network()?).await?;

    let registrar = Registrar::new(config.registrar.clone());
    match registrar.register(&container, Arc::new(ConsolePage)).await {
        RegistrarOutcome::Disabled => bail!("worker registration is disabled in development builds"),
        RegistrarOutcome::Failed(e) => return Err(e).context("registration failed"),
        RegistrarOutcome::ActivatedWaiting | RegistrarOutcome::Watching(_) => {}
    }

    let registration = container
        .registration()
        .await
        .context("registration vanished")?;
    let worker = registration
        .installing
        .or(registration.waiting)
        .or(registration.active)
        .context("nothing was installed")?;

    if worker.reached(ServiceWorkerState::Activated).await != ServiceWorkerState::Activated {
        bail!("install of {} failed, previous generation kept", worker.version);
    }

    let generation = config.worker.generation_id();
    let entries = caches.open(&generation).await?.len().await;
    println!("{}: {} entries cached", generation, entries);
    Ok(())
}

struct FetchOptions {
    navigate: bool,
    method: String,
    offline: bool,
    timeout: Option<Duration>,
}

async fn fetch(
    config: &HostConfig,
    cache_dir: &Path,
    target: &str,
    options: &FetchOptions,
) -> Result<()> {
    let network: Arc<dyn Fetcher> = if options.offline {
        Arc::new(OfflineFetcher)
    } else {
        network()?
    };
    let (container, _) = container(config, cache_dir, network).await?;
    container
        .resume(&script_url(config)?)
        .await
        .context("no installed generation, run `sw-host install` first")?;

    let url = config
        .worker
        .scope
        .join(target)
        .with_context(|| format!("invalid URL {}", target))?;
    let mut request = if options.navigate {
        Request::navigate(url)
    } else {
        let method: http::Method = options
            .method
            .parse()
            .with_context(|| format!("invalid method {}", options.method))?;
        Request::new(method, url)
    };
    if let Some(timeout) = options.timeout {
        request = request.timeout(timeout);
    }

    let response = container.fetch(request).await?;
    println!(
        "{} {} ({})",
        response.status().as_u16(),
        response.status_text,
        response.source
    );
    match response.response.content_type() {
        Some(mime) => println!("{} bytes, {}", response.response.body.len(), mime),
        None => println!("{} bytes", response.response.body.len()),
    }
    Ok(())
}

async fn list_caches(config: &HostConfig, cache_dir: &Path) -> Result<()> {
    let caches = CacheStorage::open_dir(cache_dir).await?;
    let current = config.worker.generation_id();

    let summary = caches.summary().await;
    if summary.is_empty() {
        println!("No caches in {}", cache_dir.display());
        return Ok(());
    }

    for (name, entries) in summary {
        let marker = if name == current {
            "*"
        } else if config.worker.is_stale_generation(&name) {
            "-"
        } else {
            " "
        };
        println!("{} {:<32} {:>5} entries", marker, name, entries);
    }
    Ok(())
}

async fn prune(config: &HostConfig, cache_dir: &Path) -> Result<()> {
    let caches = CacheStorage::open_dir(cache_dir).await?;
    let worker = CacheWorker::new(
        Arc::new(config.worker.clone()),
        caches,
        Arc::new(OfflineFetcher),
    );

    let deleted = worker.delete_stale_generations().await?;
    if deleted.is_empty() {
        println!("Nothing to prune");
    }
    for name in deleted {
        println!("Deleted {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_fetch() {
        let cli = Cli::try_parse_from([
            "sw-host",
            "--cache-dir",
            "/tmp/ts",
            "fetch",
            "/scout",
            "--navigate",
            "--offline",
            "--timeout",
            "3",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/ts")));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Fetch {
                navigate: true,
                offline: true,
                timeout: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["sw-host", "--log-format", "xml", "caches"]).is_err());
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "sw-host",
            "--scope",
            "https://scout.example/app/",
            "--cache-dir",
            dir.path().to_str().unwrap(),
            "caches",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.worker.scope.as_str(), "https://scout.example/app/");
        assert_eq!(config.worker.cache_dir.as_deref(), Some(dir.path()));
        assert_eq!(
            script_url(&config).unwrap().as_str(),
            "https://scout.example/app/service-worker.js"
        );
    }

    #[tokio::test]
    async fn test_prune_and_list() {
        let dir = tempfile::tempdir().unwrap();
        {
            let caches = CacheStorage::open_dir(dir.path()).await.unwrap();
            caches.open("turboscout-cache-v3").await.unwrap();
            caches.open("turboscout-cache-v4").await.unwrap();
        }

        let config = HostConfig::default();
        prune(&config, dir.path()).await.unwrap();
        list_caches(&config, dir.path()).await.unwrap();

        let caches = CacheStorage::open_dir(dir.path()).await.unwrap();
        assert_eq!(caches.keys().await, vec!["turboscout-cache-v4"]);
    }
}
