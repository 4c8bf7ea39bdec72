use anyhow::{bail, Context, Result};
use clap::Parser;
use connector::{
    args::{CliArgs, Command},
    blocks::{subscribe_blocks, BlockEvent},
    config::Config,
    triggers, Connector,
};
use connector_types::{ChainKey, EventTriggerConfig, TransactionTriggerConfig, TriggerKind};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::config::{ConfigBuilder, ConfigExt};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = CliArgs::parse();
    let command = args.command.take();
    let config: Config = ConfigBuilder::new(args).build()?;

    // setup tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(config.tracing_env_filter()?)
        .try_init()?;

    let shutdown = CancellationToken::new();
    ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || shutdown.cancel()
    })?;

    let connector = Connector::new(&config);

    match command {
        Some(Command::Watch {
            chain,
            event,
            address,
            filters,
        }) => {
            let kind = watch_kind(parse_chains(&chain)?, event, address, filters)?;
            watch(&connector, kind, shutdown).await
        }
        Some(Command::Blocks { chain }) => {
            blocks(&connector, parse_chains(&chain)?, shutdown).await
        }
        None => bail!("no command given, see --help"),
    }
}

fn parse_chains(chains: &[String]) -> Result<Vec<ChainKey>> {
    chains
        .iter()
        .map(|chain| ChainKey::new(chain.as_str()).with_context(|| format!("chain {chain}")))
        .collect()
}

fn watch_kind(
    chains: Vec<ChainKey>,
    events: Vec<String>,
    address: Option<String>,
    filters: Vec<String>,
) -> Result<TriggerKind> {
    if events.is_empty() {
        let to = address
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("--address")?;

        return Ok(TriggerKind::Transaction(TransactionTriggerConfig {
            chains,
            from: None,
            to,
        }));
    }

    let mut parameter_filters = Map::new();
    for filter in filters {
        let Some((name, value)) = filter.split_once('=') else {
            bail!("filter {filter} is not name=value");
        };
        parameter_filters.insert(name.trim().to_string(), Value::String(value.trim().to_string()));
    }

    Ok(TriggerKind::Event(EventTriggerConfig {
        chains,
        contract_address: address,
        events,
        parameter_filters,
    }))
}

async fn watch(
    connector: &Connector,
    kind: TriggerKind,
    shutdown: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let trigger = connector.triggers.create(&kind, tx)?;
    trigger.start()?;

    triggers::forward(trigger.as_ref(), &mut rx, &shutdown, |notification| {
        match serde_json::to_string(&notification) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::error!("Unable to print notification: {err}"),
        }
    })
    .await?;

    Ok(())
}

async fn blocks(
    connector: &Connector,
    chains: Vec<ChainKey>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut blocks = subscribe_blocks(&connector.pool, &chains)?;

    loop {
        let (chain, event) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = blocks.next() => match next {
                Some(next) => next,
                None => return Ok(()),
            },
        };

        match event {
            BlockEvent::Block(block) => println!(
                "{}",
                serde_json::json!({
                    "chain": chain,
                    "number": block.header.number,
                    "hash": block.header.hash,
                    "transactions": block.transactions.len(),
                })
            ),
            BlockEvent::Skipped { from, to } => {
                tracing::warn!("{chain}: blocks {from}..={to} skipped");
            }
            BlockEvent::Fatal(reason) => bail!("{chain}: {reason}"),
        }
    }
}
