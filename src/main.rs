use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bmsread::config::Config;
use bmsread::poller::{run_all, LogSink, Poller};
use bmsread::settings::JsonFileStore;
use bmsread::{probe, TransportDescriptor};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Poll LiFePO4 battery management systems and log their telemetry and charge limits
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Where to look for batteries, e.g. `serial:/dev/ttyUSB0`, `jk-ble:JK_B2A8S20P`,
    /// `ligen-ble:BT_HC6172`
    #[clap(required = true)]
    targets: Vec<String>,

    /// YAML configuration file
    #[clap(long, short)]
    config: Option<PathBuf>,

    /// Directory holding the persisted charge state, one file per battery
    #[clap(long, default_value = ".")]
    state_dir: PathBuf,
}

fn state_file(dir: &Path, id: &str) -> PathBuf {
    let name: String = id.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
    dir.join(format!("{name}.json"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let mut pollers = Vec::new();
    for target in &args.targets {
        let descriptor: TransportDescriptor = target.parse()?;
        let probed = match probe(&descriptor, &config).await {
            Ok(probed) => probed,
            Err(err) => {
                warn!("{descriptor}: {err}");
                continue;
            }
        };
        let path = state_file(&args.state_dir, &probed.battery.settings_id());
        let store = JsonFileStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
        pollers.push(Poller::new(probed, &config, Box::new(store), Box::new(LogSink))?);
    }
    if pollers.is_empty() {
        bail!("no battery found");
    }

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
        }
        ctrl_c.cancel();
    });

    let outcomes = run_all(pollers, token).await;
    let failed = outcomes.iter().filter(|(_, result)| result.is_err()).count();
    info!("{} pollers stopped, {failed} gave up", outcomes.len());
    Ok(())
}
