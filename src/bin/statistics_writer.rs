//--------------------------------------------------------------------------------------------------
// Statistics writer: subscribes to evaluations and writes every statistics payload it is sent
// to <output-dir>/<evaluation>/<scope>/<n>.<schema>, where scope is the group id or "ungrouped".
//
//   cargo run --bin statistics-writer -- --output-dir ./out --formats csv,png
//--------------------------------------------------------------------------------------------------
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use evaluation_messaging::{
    BrokerConnectionFactory, ClientOptions, Consumer, ConsumerDescription, ConsumerError, ConsumerFactory,
    ConsumerResult, EvaluationDescription, Format, MessagingClient, StatisticsMessage, config, logging,
};
use tokio::signal;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "statistics-writer", about = "Writes evaluation statistics to a directory")]
struct Opt {
    /// Connection properties resource
    #[arg(long, default_value = config::DEFAULT_PROPERTIES_NAME)]
    properties: String,

    /// Root directory of the written statistics
    #[arg(long, default_value = "statistics")]
    output_dir: PathBuf,

    /// Consumer id announced to producers
    #[arg(long)]
    consumer_id: Option<String>,

    /// Formats offered to producers
    #[arg(long, value_delimiter = ',', default_value = "protobuf")]
    formats: Vec<Format>,

    /// Start an embedded broker on another port when the configured one is taken
    #[arg(long)]
    dynamic_binding: bool,
}

struct DirectoryConsumerFactory {
    root: PathBuf,
    description: ConsumerDescription,
}

impl DirectoryConsumerFactory {
    fn consumer(&self, scope: &str) -> Box<dyn Consumer> {
        Box::new(DirectoryConsumer {
            root: self.root.clone(),
            scope: file_name(scope),
            written: BTreeSet::new(),
        })
    }
}

impl ConsumerFactory for DirectoryConsumerFactory {
    fn get_consumer(&self, _description: &EvaluationDescription) -> ConsumerResult<Box<dyn Consumer>> {
        Ok(self.consumer("ungrouped"))
    }

    fn get_grouped_consumer(
        &self,
        _description: &EvaluationDescription,
        group_id: &str,
    ) -> ConsumerResult<Box<dyn Consumer>> {
        Ok(self.consumer(group_id))
    }

    fn consumer_description(&self) -> ConsumerDescription {
        self.description.clone()
    }
}

struct DirectoryConsumer {
    root: PathBuf,
    scope: String,
    written: BTreeSet<PathBuf>,
}

impl Consumer for DirectoryConsumer {
    fn accept(&mut self, statistics: &StatisticsMessage) -> ConsumerResult<()> {
        let evaluation_id = statistics
            .evaluation_id()
            .ok_or_else(|| ConsumerError::failed("statistics without an evaluation id"))?;

        let directory = self.root.join(file_name(evaluation_id)).join(&self.scope);
        fs::create_dir_all(&directory)?;

        let path = directory.join(format!("{}.{}", self.written.len() + 1, file_name(statistics.schema())));
        fs::write(&path, statistics.payload())?;
        debug!("wrote {}", path.display());

        self.written.insert(path);
        Ok(())
    }

    fn finalize(&mut self) -> ConsumerResult<BTreeSet<PathBuf>> {
        Ok(std::mem::take(&mut self.written))
    }
}

fn file_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init();

    let opt = Opt::parse();
    let root = absolute(&opt.output_dir)?;
    fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;

    let consumer_id = opt
        .consumer_id
        .unwrap_or_else(|| format!("statistics-writer-{}", Uuid::new_v4()));
    let factory = Arc::new(DirectoryConsumerFactory {
        root: root.clone(),
        description: ConsumerDescription::new(&consumer_id, opt.formats.iter().copied()),
    });

    let connections = BrokerConnectionFactory::from_resource(&opt.properties, opt.dynamic_binding)
        .await
        .context("connecting to the broker")?;
    let client = MessagingClient::start(factory, &connections, ClientOptions::default())
        .await
        .context("starting the messaging client")?;

    info!("{} writing statistics below {}", consumer_id, root.display());

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    client.stop().await;
    connections.close().await;

    Ok(())
}
