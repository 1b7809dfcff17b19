//! Console client for Archipelago Super Metroid.
//!
//! Run with: cargo run -p apclient-console -- --connect localhost
//!
//! Reads commands from stdin and prints the console feed to stdout.

mod commands;

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Arc,
};

use apclient_core::{
    ClientContext, ClientStorage, ConnectionStatus, ConsoleMsg, ConsoleStore, DeviceConnector,
};
use apclient_device::{DEFAULT_USB2SNES_URL, MemoryConnector, MemoryDevice, Usb2SnesConnector};
use apclient_session::{
    ClientConfig, ClientManager, FileStorage, MemoryLayout, MemoryStorage, UserCommand,
    WebSocketFactory,
};
use clap::Parser;
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "apclient")]
#[command(about = "Archipelago multiworld client for Super Metroid")]
#[command(version)]
struct Cli {
    /// Server to connect to once a device is attached
    #[arg(long, value_name = "ADDRESS")]
    connect: Option<String>,

    /// Server password
    #[arg(long)]
    password: Option<String>,

    /// usb2snes endpoint served by SNI or QUsb2Snes
    #[arg(long, value_name = "URL", default_value = DEFAULT_USB2SNES_URL)]
    device_url: String,

    /// Use an in-process memory device instead of usb2snes
    #[arg(long)]
    mock_device: bool,

    /// Directory for the data package cache and client identity
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Also append log records to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Start with item delivery paused
    #[arg(long)]
    no_receive_items: bool,
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    Ok(())
}

fn mock_connector() -> Arc<dyn DeviceConnector> {
    let device = Arc::new(MemoryDevice::new("Mock SNES"));
    let layout = MemoryLayout::SUPER_METROID;
    device.poke(layout.rom_name, b"SM MOCK ROM");
    Arc::new(MemoryConnector::new([device]))
}

async fn print_feed(console: Arc<ConsoleStore>) {
    let mut feed = console.history_plus_stream();
    while let Some(msg) = feed.next().await {
        match &msg {
            ConsoleMsg::Error(text) => println!("! {text}"),
            ConsoleMsg::Status(ConnectionStatus::Connected) => {}
            ConsoleMsg::Status(_) => println!("[{}]", msg.text()),
            _ => println!("{}", msg.text()),
        }
    }
}

async fn read_input(commands: mpsc::UnboundedSender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read stdin: {e}");
                break;
            }
        };
        match commands::parse_line(&line) {
            Ok(Some(command)) => {
                let shutdown = command == UserCommand::Shutdown;
                if commands.send(command).is_err() || shutdown {
                    return;
                }
            }
            Ok(None) => {}
            Err(usage) => println!("{usage}"),
        }
    }
    let _ = commands.send(UserCommand::Shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let config = ClientConfig {
        receive_items: !cli.no_receive_items,
        ..ClientConfig::default()
    };
    let ctx = ClientContext::default();

    let storage: Arc<dyn ClientStorage> = match cli.data_dir.or_else(FileStorage::default_dir) {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Using data directory");
            Arc::new(FileStorage::new(dir))
        }
        None => {
            tracing::warn!("No data directory available; cache will not persist");
            Arc::new(MemoryStorage::new())
        }
    };

    let connector: Arc<dyn DeviceConnector> = if cli.mock_device {
        mock_connector()
    } else {
        Arc::new(
            Usb2SnesConnector::new(cli.device_url, ctx.tags.join(" "))
                .with_timeout(config.device_timeout),
        )
    };

    let console = Arc::new(ConsoleStore::new());
    let manager = ClientManager::new(
        config,
        ctx,
        connector,
        Arc::new(WebSocketFactory),
        storage,
        Arc::clone(&console),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(address) = cli.connect {
        tx.send(UserCommand::Connect {
            address,
            password: cli.password,
        })?;
    }

    let printer = tokio::spawn(print_feed(console));
    let input = tokio::spawn(read_input(tx));

    manager.run(rx).await;

    input.abort();
    printer.abort();
    Ok(())
}
