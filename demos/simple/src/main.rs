use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use devclaim::cloud::DeviceIdentity;
use devclaim::workflow::{ClaimWorkflow, Progress};

use devclaim_os::clock::MonotonicClock;
use devclaim_os::cloud::MqttCloud;
use devclaim_os::config::HostConfig;
use devclaim_os::error::Result;
use devclaim_os::identity::HostIdentity;
use devclaim_os::runner::Runner;
use devclaim_os::storage::FileStore;

use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path of the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Offset of the configuration record inside the EEPROM image.
    #[arg(long)]
    offset: Option<usize>,

    /// Device identifier. Derived from the MAC address when missing.
    #[arg(long)]
    device_id: Option<String>,

    /// Claim the device again even when it is already claimed.
    #[arg(long, default_value_t = false)]
    force: bool,
}

fn load_config(cli: Cli) -> Result<(HostConfig, bool)> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    };

    if let Some(offset) = cli.offset {
        config.claim.offset = offset;
    }

    if cli.device_id.is_some() {
        config.device_id = cli.device_id;
    }

    config.validate()?;

    Ok((config, cli.force))
}

async fn claim(config: HostConfig, force: bool) -> Result<Progress> {
    let identity = HostIdentity::detect(config.device_id.as_deref())?;
    let store = FileStore::open(&config.storage.path, config.storage.capacity)?;

    let cloud = MqttCloud::connect(&config.broker, &identity.device_id());

    let mut workflow = ClaimWorkflow::with_byte_store(
        config.claim,
        store,
        cloud,
        MonotonicClock::new(),
        &identity,
    )?;

    if force {
        info!("Forcing a new claim");
        workflow.force_claim()?;
    }

    if workflow.progress() == Progress::Done {
        info!("Device `{}` is already claimed", workflow.device_id());
    }

    let cancellation_token = CancellationToken::new();
    let ctrl_c_token = cancellation_token.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping");
            ctrl_c_token.cancel();
        }
    });

    let mut runner = Runner::new(workflow, Duration::from_millis(config.tick_interval_ms));
    let progress = runner.run(&cancellation_token).await;

    cancellation_token.cancel();

    let (_, cloud, _) = runner.into_inner().into_parts();
    cloud.shutdown().await;

    Ok(progress)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber, `log` records included.
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();

    let (config, force) = match load_config(cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match claim(config, force).await {
        Ok(Progress::Done) => {
            info!("Device claimed");
            ExitCode::SUCCESS
        }
        Ok(progress) => {
            warn!("Device not claimed: {progress}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
