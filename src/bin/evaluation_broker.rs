//--------------------------------------------------------------------------------------------------
// Standalone embedded broker. Producers and writers in other processes on this host
// detect it on the configured port and connect to it instead of starting their own.
//
//   cargo run --bin evaluation-broker -- --properties config/eventbroker.properties
//   cargo run --bin evaluation-broker -- --dynamic-binding
//--------------------------------------------------------------------------------------------------
use anyhow::Context;
use clap::Parser;
use evaluation_messaging::{BrokerProperties, EmbeddedBroker, config, load_properties, logging};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "evaluation-broker", about = "Runs an embedded evaluation broker")]
struct Opt {
    /// Connection properties resource
    #[arg(long, default_value = config::DEFAULT_PROPERTIES_NAME)]
    properties: String,

    /// Bind an ephemeral port when the configured one is taken
    #[arg(long)]
    dynamic_binding: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init();

    let opt = Opt::parse();

    let properties = load_properties(&opt.properties)
        .with_context(|| format!("loading broker properties from {}", opt.properties))?;
    let properties = BrokerProperties::new(properties);

    let broker = EmbeddedBroker::start(&properties, opt.dynamic_binding)
        .await
        .context("starting the embedded broker")?;

    info!(
        "evaluation broker ready on port {}, clients connect with {}",
        broker.messaging_port(),
        broker.binding_url()
    );

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    broker.close().await;

    Ok(())
}
