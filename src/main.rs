//! `eventbus` - publish to or subscribe on an MQTT broker from the command line

use clap::{Parser, Subcommand};
use mqtt_eventbus::config::ConnectionConfig;
use mqtt_eventbus::observability::{command_span, init_default_logging};
use mqtt_eventbus::transport::mqtt::{ConnectionManager, ConnectionState, Session};
use mqtt_eventbus::EventBusError;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Instrument};

/// Default config locations tried when `-c` is not given
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["eventbus.toml", "config/eventbus.toml"];

/// Publish and subscribe over an MQTT broker
#[derive(Parser)]
#[command(name = "eventbus")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EVENTBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host, overriding the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Broker port, overriding the configuration file
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message and exit
    Publish {
        topic: String,
        payload: String,
    },
    /// Print every message matching the given filters until Ctrl-C
    Subscribe {
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish { topic, payload } => {
            let span = command_span!(command = "publish", topic = %topic);
            publish(&config, &topic, payload).instrument(span).await
        }
        Commands::Subscribe { topics } => {
            let span = command_span!(command = "subscribe");
            subscribe(&config, &topics).instrument(span).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {e}");
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<ConnectionConfig, EventBusError> {
    let found = cli.config.clone().or_else(|| {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    });

    let mut config = match found {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ConnectionConfig::load_from_file(Path::new(&path))?
        }
        None => ConnectionConfig::new("localhost", 1883),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn publish(
    config: &ConnectionConfig,
    topic: &str,
    payload: String,
) -> Result<(), EventBusError> {
    let session = ConnectionManager::new().connect(config).await?;
    let result = session.publish(topic, payload).await;
    session.close().await;
    result?;
    info!("Published to {topic}");
    Ok(())
}

async fn subscribe(config: &ConnectionConfig, topics: &[String]) -> Result<(), EventBusError> {
    let session = ConnectionManager::new().connect(config).await?;

    let mut handles = Vec::with_capacity(topics.len());
    for topic in topics {
        let handle = session
            .subscribe(topic, |topic, payload| println!("{topic}\t{payload}"))
            .await?;
        handles.push(handle);
    }
    for handle in &handles {
        if let Err(e) = handle.acknowledged().await {
            session.close().await;
            return Err(e.into());
        }
    }

    info!("Subscribed to {} filter(s), press Ctrl-C to stop", handles.len());
    let outcome = wait_for_shutdown(&session).await;
    session.close().await;
    outcome
}

async fn wait_for_shutdown(session: &Session) -> Result<(), EventBusError> {
    let mut states = session.state_changes();
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
        state = states.wait_for(|state| state.is_terminated()) => {
            match state.map(|s| s.clone()) {
                Ok(ConnectionState::ConnectionLost(reason)) => {
                    error!("Connection lost: {reason}");
                    Err(EventBusError::ConnectionLost(reason))
                }
                _ => Ok(()),
            }
        }
    }
}
