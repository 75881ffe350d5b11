use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use client_core::{
    load_settings_from, Dashboard, EventSink, HttpMemoryApi, Inbound, MemoryManager, Settings,
    SocketTransport, ViewUpdate,
};
use shared::{
    domain::MemoryId,
    protocol::{InboundEvent, OutboundEvent},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the health intelligence backend")]
struct Args {
    /// Overrides `backend_url` from the config file and environment.
    #[arg(long, global = true)]
    backend_url: Option<String>,
    #[arg(long, global = true, default_value = client_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream live dashboard updates until interrupted.
    Watch,
    /// Send one chat message and print the liaison's reply.
    Chat {
        message: String,
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    #[command(subcommand)]
    Memories(MemoriesCommand),
    /// Nudge the backend's tolerance for one risk type.
    Tolerance { risk_type: String, amount: f64 },
}

#[derive(Subcommand, Debug)]
enum MemoriesCommand {
    List,
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete every memory from the start of `start` through the end of `end`.
    DeleteRange {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    Wipe {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config);
    if let Some(url) = args.backend_url {
        settings.backend_url = url;
    }
    info!(backend = %settings.backend_url(), "starting dashboard");

    match args.command {
        Command::Watch => watch(&settings).await,
        Command::Chat { message, wait_secs } => {
            chat(&settings, &message, Duration::from_secs(wait_secs)).await
        }
        Command::Memories(command) => memories(&settings, command).await,
        Command::Tolerance { risk_type, amount } => tolerance(&settings, risk_type, amount).await,
    }
}

async fn watch(settings: &Settings) -> Result<()> {
    let (mut dashboard, transport, inbound) = Dashboard::connect(settings)?;
    dashboard.mount().await;
    let frames = dashboard.spawn_frame_loop();
    let printer = tokio::spawn(print_updates(
        dashboard.subscribe_updates(),
        Stores::from(&dashboard),
    ));

    tokio::select! {
        _ = dashboard.run(inbound) => warn!("event stream ended"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("interrupted; shutting down");
        }
    }

    frames.abort();
    printer.abort();
    transport.shutdown().await;
    Ok(())
}

/// Cloned store handles the printer task reads from.
struct Stores {
    timeline: client_core::TimelineStore,
    council: client_core::CouncilLog,
    chat: client_core::ChatPanel,
    intervention: client_core::InterventionModal,
    environment: client_core::EnvironmentField,
    graph: client_core::GraphState,
}

impl From<&Dashboard> for Stores {
    fn from(dashboard: &Dashboard) -> Self {
        Self {
            timeline: dashboard.timeline.clone(),
            council: dashboard.council.clone(),
            chat: dashboard.chat.clone(),
            intervention: dashboard.intervention.clone(),
            environment: dashboard.environment.clone(),
            graph: dashboard.graph.clone(),
        }
    }
}

async fn print_updates(
    mut updates: tokio::sync::broadcast::Receiver<ViewUpdate>,
    stores: Stores,
) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "renderer fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match update {
            ViewUpdate::Connected => println!("[link] connected"),
            ViewUpdate::Timeline => {
                if let Some(entry) = stores.timeline.entries().last() {
                    let flag = if entry.risk { " RISK" } else { "" };
                    println!(
                        "[timeline] {} {}{flag}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.description
                    );
                }
            }
            ViewUpdate::Council => {
                if let Some(line) = stores.council.lines().first() {
                    println!("[council] {}: {}", line.agent, line.message);
                }
            }
            ViewUpdate::Chat => {
                if let Some(message) = stores.chat.messages().last() {
                    println!("[chat:{:?}] {}", message.role, message.content);
                }
            }
            ViewUpdate::Risk(level) => println!("[risk] {level} {}", level.color().to_hex()),
            ViewUpdate::InterventionOpened => {
                if let Some(intervention) = stores.intervention.dismiss() {
                    println!("[intervention] {}", intervention.summary);
                    for action in &intervention.actions {
                        println!("  - {action}");
                    }
                }
            }
            ViewUpdate::Environment => {
                let frame = stores.environment.snapshot();
                println!(
                    "[environment] target {} turbulence {:.2} speed {:.2}",
                    frame.target.color.to_hex(),
                    frame.target.turbulence,
                    frame.target.speed
                );
            }
            ViewUpdate::GraphHighlights => {
                let snapshot = stores.graph.snapshot();
                let highlighted: Vec<_> = snapshot
                    .nodes
                    .iter()
                    .filter(|node| node.highlighted)
                    .map(|node| node.label.as_str())
                    .collect();
                println!("[graph] highlighted: {}", highlighted.join(", "));
            }
        }
    }
}

async fn wait_for_connect(inbound: &mut Inbound, within: Duration) -> Result<()> {
    let connected = tokio::time::timeout(within, async {
        while let Some(event) = inbound.recv().await {
            if matches!(event, InboundEvent::Connect) {
                return true;
            }
        }
        false
    })
    .await
    .context("timed out waiting for backend connection")?;
    if !connected {
        bail!("transport stopped before connecting");
    }
    Ok(())
}

async fn chat(settings: &Settings, message: &str, wait: Duration) -> Result<()> {
    let (transport, mut inbound) = SocketTransport::connect(settings)?;
    wait_for_connect(&mut inbound, wait).await?;
    transport.emit(OutboundEvent::ChatMessage {
        message: message.to_string(),
    })?;

    let reply = tokio::time::timeout(wait, async {
        while let Some(event) = inbound.recv().await {
            if let InboundEvent::ChatReply(reply) = event {
                return Some(reply.message);
            }
        }
        None
    })
    .await;
    transport.shutdown().await;

    match reply {
        Ok(Some(reply)) => {
            println!("{reply}");
            Ok(())
        }
        Ok(None) => bail!("connection closed before a reply arrived"),
        Err(_) => bail!("no reply within {wait:?}"),
    }
}

async fn tolerance(settings: &Settings, risk_type: String, amount: f64) -> Result<()> {
    let (transport, mut inbound) = SocketTransport::connect(settings)?;
    wait_for_connect(&mut inbound, Duration::from_secs(30)).await?;
    transport.emit(OutboundEvent::AdjustTolerance {
        risk_type: risk_type.clone(),
        amount,
    })?;
    transport.shutdown().await;
    println!("requested {risk_type} tolerance change of {amount}");
    Ok(())
}

async fn memories(settings: &Settings, command: MemoriesCommand) -> Result<()> {
    let api = Arc::new(HttpMemoryApi::new(settings.backend_url())?);
    let manager = MemoryManager::new(api, client_core::GraphState::new());

    match command {
        MemoriesCommand::List => {
            manager.load().await?;
            manager.refresh_graph().await?;
        }
        MemoriesCommand::Delete { ids } => {
            manager.load().await?;
            let ids: BTreeSet<MemoryId> = ids.into_iter().map(MemoryId::new).collect();
            for id in &ids {
                manager.toggle(id);
            }
            let report = manager.delete_selected().await;
            for id in &report.deleted {
                println!("deleted {id}");
            }
            for (id, err) in &report.failed {
                eprintln!("failed {id}: {err}");
            }
            if !report.is_complete() {
                print_records(&manager);
                bail!("{} of {} deletes failed", report.failed.len(), ids.len());
            }
        }
        MemoriesCommand::DeleteRange { start, end } => {
            manager.delete_day_range(start, end).await?;
        }
        MemoriesCommand::Wipe { yes } => {
            if !yes {
                bail!("refusing to delete every memory without --yes");
            }
            manager.wipe_all().await?;
        }
    }

    print_records(&manager);
    Ok(())
}

fn print_records(manager: &MemoryManager) {
    let records = manager.records();
    let snapshot = manager.graph().snapshot();
    println!("{} memories, {} links", records.len(), snapshot.edges.len());
    for record in records {
        println!(
            "{}  {}  [{}] {}",
            record.node_id(),
            record.timestamp,
            record.user_state,
            record.statement
        );
    }
}
