use alarm_bridge::config::Config;
use alarm_bridge::engine::Engine;
use alarm_bridge::gpio::SysfsGpio;
use alarm_bridge::instance_lock::InstanceLock;
use alarm_bridge::webhooks::HttpTransport;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "/etc/alarm-bridge/alarm.cfg";
const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

#[derive(Parser)]
#[command(name = "alarm-bridge")]
#[command(about = "Mirror wired alarm zones to home-automation webhooks")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "ALARM_BRIDGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// sysfs GPIO directory
    #[arg(long, default_value = DEFAULT_GPIO_ROOT)]
    gpio_root: PathBuf,
}

fn init_logger(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    info!("Starting alarm bridge");

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}: {}", cli.config.display(), e);
            return ExitCode::from(2);
        }
    };
    info!("Configuration loaded from {}", cli.config.display());
    if cli.verbose > 0 {
        match serde_json::to_string_pretty(&config) {
            Ok(dump) => log::debug!("Configuration:\n{}", dump),
            Err(e) => log::debug!("Configuration not printable: {}", e),
        }
    }
    info!(
        "  Webhooks: http://{}:{} (delay {:?}, timeout {:?})",
        config.webhooks.host,
        config.webhooks.port,
        config.dispatch_delay(),
        config.url_timeout()
    );
    for zone in &config.zones {
        info!(
            "  {} (header pin {}) -> {}",
            zone.pin,
            zone.pin
                .header_pin()
                .map_or_else(|| "?".to_string(), |p| p.to_string()),
            zone.id
        );
    }

    let _lock = match InstanceLock::acquire() {
        Ok(lock) => lock,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let transport = match HttpTransport::new(&config.webhooks, config.url_timeout()) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Failed to create webhook client: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let gpio = Arc::new(SysfsGpio::new(&cli.gpio_root));

    let (engine, _handle) = match Engine::new(&config, gpio, transport) {
        Ok(pair) => pair,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let shutdown = CancellationToken::new();
    let mut engine_task = tokio::spawn(engine.run(shutdown.clone()));
    info!("Alarm bridge is running, press Ctrl+C to exit");

    let mut terminate = match unix_signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            None
        }
    };

    tokio::select! {
        result = &mut engine_task => {
            // The engine only returns on its own when startup failed.
            return match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!("Engine stopped: {}", e);
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!("Engine task failed: {}", e);
                    ExitCode::FAILURE
                }
            };
        }
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received interrupt");
        }
        _ = async {
            match terminate.as_mut() {
                Some(stream) => { stream.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => {
            info!("Received SIGTERM");
        }
    }

    shutdown.cancel();
    match engine_task.await {
        Ok(Ok(())) => {
            info!("Alarm bridge stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Engine stopped: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Engine task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
