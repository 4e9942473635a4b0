use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use portico::acme::AcmeManager;
use portico::config::Config;
use portico::upstream::{self, Upstreams};
use portico::{observability, server};

/// Host-routing HTTP/HTTPS front door.
#[derive(Parser)]
#[command(name = "portico", version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file. Defaults to `conf.yaml` next
    /// to the executable.
    #[arg(long = "conf")]
    conf: Option<PathBuf>,
}

fn default_conf_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("conf.yaml")))
        .unwrap_or_else(|| PathBuf::from("conf.yaml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let conf_path = args.conf.unwrap_or_else(default_conf_path);

    let config = Config::load(&conf_path)
        .map_err(|err| anyhow::anyhow!("load config {}: {err}", conf_path.display()))?;

    let _log_guard = observability::init_tracing(&config)?;
    tracing::info!("configuration loaded from {}", conf_path.display());

    upstream::install(Upstreams::from_config(&config.upstreams)?)?;

    let built = server::build_server_slots(&config)?;

    let acme = Arc::new(AcmeManager::new(
        &config.base,
        tokio::runtime::Handle::current(),
    ));
    acme.set_host_whitelist(built.autocert_hosts);

    let request_timeout = std::time::Duration::from_secs(config.base.request_timeout_secs);
    server::run(built.slots, built.cert_registry, acme, request_timeout).await?;
    Ok(())
}
