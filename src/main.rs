//! CLI for pulsar-trigger
//!
//! Consumes one topic through the Pulsar WebSocket API and prints every
//! message as a JSON line on stdout until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use pulsar_trigger::broker::websocket::WebSocketClient;
use pulsar_trigger::config::{DEFAULT_CONFIG_FILE, load_config_from};
use pulsar_trigger::emitter::JsonLinesEmitter;
use pulsar_trigger::utils::logging;
use pulsar_trigger::{LifecycleController, StopOutcome};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pulsar-trigger", about = "Consume a Pulsar topic and emit JSON lines")]
struct Cli {
    /// Configuration file, without extension
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,
    /// Topic to consume, overrides the configuration
    #[arg(long, env = "TRIGGER_TOPIC")]
    topic: Option<String>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        // logging may not be initialised yet
        eprintln!("Trigger failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = load_config_from(&cli.config)?;
    if let Some(topic) = cli.topic {
        settings.subscription.topic = topic;
    }
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.logging.level));

    let connection_params = settings.connection_parameters()?;
    let subscription_params = settings.subscription_parameters()?;
    let controller = LifecycleController::new(settings.lifecycle_options());

    let handle = controller
        .start(
            &WebSocketClient::new(),
            connection_params,
            subscription_params,
            Arc::new(JsonLinesEmitter::stdout()),
        )
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            if handle.stop().await == StopOutcome::GraceElapsed {
                error!("Teardown did not finish in time.");
            }
        }
        _ = handle.stopped() => {
            return Err("consumer stopped unexpectedly".into());
        }
    }

    let stats = handle.stats();
    info!(
        received = stats.received,
        acknowledged = stats.acknowledged,
        emit_failures = stats.emit_failures,
        "trigger stopped"
    );
    Ok(())
}
