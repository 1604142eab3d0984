use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

use warren::config::{ConnectionConfiguration, Settings, load_config};
use warren::protocol::ConnectionFactory;
use warren::utils::logging;
use warren::{
    Bus, BusBuilder, MemoryBroker, Message, NoOpConsumerErrorStrategy,
    RetryConsumerErrorStrategy, SchedulerWorker,
};

#[derive(Parser)]
#[command(name = "warren", version, about = "Typed messaging bus")]
struct Cli {
    /// Log level (error, warn, info, debug, trace). `WARREN_LOG` overrides it.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish, schedule and consume a few messages on an in-process broker.
    Demo {
        /// Seconds until the scheduled greeting is published.
        #[arg(long, default_value_t = 2)]
        delay_secs: i64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    text: String,
}

impl Message for Greeting {
    const TYPE_NAME: &'static str = "Warren.Demo.Greeting:Warren";
}

/// The bus and its retry strategy both connect with the configured
/// credentials and virtual host.
fn build_bus(settings: &Settings, factory: Arc<dyn ConnectionFactory>) -> Bus {
    let strategy = RetryConsumerErrorStrategy::with_fallback(
        factory.clone(),
        Arc::new(NoOpConsumerErrorStrategy),
        settings.retry_config(),
    );
    BusBuilder::from_shared(factory)
        .config(settings.bus_config())
        .error_strategy(Arc::new(strategy))
        .build()
}

/// The demo broker knows the configured user and virtual host, so any
/// configuration that parses can log in.
fn demo_broker(configuration: &ConnectionConfiguration) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.add_user(&configuration.username, &configuration.password);
    broker.add_virtual_host(&configuration.virtual_host);
    broker
}

async fn demo(settings: Settings, delay_secs: i64) -> Result<(), Box<dyn std::error::Error>> {
    let configuration = &settings.connection.configuration;
    let broker = demo_broker(configuration);
    let bus = build_bus(&settings, Arc::new(broker.connector(configuration)));
    bus.ensure_connected(settings.bus_config().connect_timeout)
        .await?;

    let scheduler_config = settings.scheduler_config();
    let worker = SchedulerWorker::for_bus(&bus, &scheduler_config)?;
    worker.start(&bus, &scheduler_config.subscription_id).await?;

    bus.subscribe("demo", |greeting: Greeting| {
        info!(text = %greeting.text, "greeting received");
        Ok(())
    })
    .await?;

    bus.publish(&Greeting {
        text: "hello now".to_string(),
    })
    .await?;
    let at = chrono::Utc::now() + chrono::Duration::seconds(delay_secs.max(1));
    bus.future_publish(
        at,
        &Greeting {
            text: "hello later".to_string(),
        },
    )
    .await?;
    info!(%at, "greeting scheduled");

    tokio::time::sleep(Duration::from_secs(delay_secs.max(1).unsigned_abs() + 1)).await;
    worker.shutdown().await;
    bus.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let settings = load_config()?;
    info!(broker = %settings.connection.configuration.endpoint(), "configuration loaded");

    match cli.command {
        Command::Demo { delay_secs } => demo(settings, delay_secs).await,
    }
}
