use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use blescard_core::DeviceId;
use blescard_session::{Callback, SessionConfig, SessionListener};
use blescard_transport::{
    SessionDriver, SessionHandle,
    mock::{MockReader, MockReaderConfig, MockReaderHandle},
};

mod printer;

use printer::Printer;

/// How long to wait for any single reader answer.
const WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(version, about = "Run a smart-card reader session against a simulated CCID reader")]
struct Cli {
    /// Number of slots of the simulated reader
    #[arg(long, default_value_t = 2)]
    slots: u8,

    /// Slots holding a card at startup
    #[arg(long = "card", default_values_t = [0u8])]
    cards: Vec<u8>,

    /// Expose the secured CCID service variant
    #[arg(long)]
    secured: bool,

    /// Session configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Response deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Debug level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and show the reader metadata
    Info,

    /// Send APDUs to a card
    Transmit {
        /// Slot addressed
        #[arg(short, long, default_value_t = 0)]
        slot: u8,

        /// APDUs as hex strings, sent in order
        #[arg(required = true)]
        apdus: Vec<String>,
    },

    /// Send a vendor control command to the reader
    Control {
        /// Command bytes as a hex string
        data: String,
    },

    /// Read the battery state
    PowerInfo,

    /// Walk through card removal, insertion and reader sleep
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let reader = MockReaderConfig {
        slot_count: cli.slots,
        secured: cli.secured,
        ..MockReaderConfig::default()
    };
    let (reader, mock) = MockReader::with_config(reader);
    for &slot in &cli.cards {
        mock.insert_card(slot)
            .await
            .with_context(|| format!("cannot insert a card in slot {slot}"))?;
    }

    let device = DeviceId::new("mock:0")?;
    let mut handle = SessionDriver::new(config, reader, device)?.start()?;
    let mut printer = Printer;

    info!("Opening session");
    handle.open().await?;
    wait_for(&mut handle, &mut printer, |c| matches!(c, Callback::SessionReady(_))).await?;

    match &cli.command {
        Commands::Info => {}
        Commands::Transmit { slot, apdus } => {
            for apdu in apdus {
                let apdu = parse_hex(apdu)?;
                println!("slot {} >> {}", slot, hex::encode_upper(&apdu));
                handle.transmit(*slot, apdu).await?;
                wait_for(&mut handle, &mut printer, |c| {
                    matches!(
                        c,
                        Callback::TransmitResponse { .. } | Callback::ReaderOrCardError { .. }
                    )
                })
                .await?;
            }
        }
        Commands::Control { data } => {
            handle.control(parse_hex(data)?).await?;
            wait_for(&mut handle, &mut printer, |c| {
                matches!(c, Callback::ControlResponse(_))
            })
            .await?;
        }
        Commands::PowerInfo => {
            handle.read_power_info().await?;
            wait_for(&mut handle, &mut printer, |c| {
                matches!(c, Callback::PowerInfo { .. })
            })
            .await?;
        }
        Commands::Demo => demo(&mut handle, &mock, &mut printer, cli.slots).await?,
    }

    handle.disconnect().await?;
    wait_for(&mut handle, &mut printer, |c| *c == Callback::SessionClosed).await?;
    handle.shutdown().await?;
    Ok(())
}

/// Card and reader events, one at a time.
async fn demo(
    handle: &mut SessionHandle,
    mock: &MockReaderHandle,
    printer: &mut Printer,
    slots: u8,
) -> Result<()> {
    let slot = slots.saturating_sub(1);

    mock.remove_card(slot).await?;
    wait_for(handle, printer, |c| {
        matches!(c, Callback::ReaderStatusChanged { present: false, .. })
    })
    .await?;

    mock.insert_card(slot).await?;
    wait_for(handle, printer, |c| matches!(c, Callback::CardConnected(_))).await?;

    handle.transmit(slot, vec![0x00, 0x84, 0x00, 0x00, 0x08]).await?;
    wait_for(handle, printer, |c| matches!(c, Callback::TransmitResponse { .. })).await?;

    mock.sleep().await;
    wait_for(handle, printer, |c| {
        matches!(c, Callback::SleepStateChanged { sleeping: true })
    })
    .await?;

    mock.wake().await;
    wait_for(handle, printer, |c| {
        matches!(c, Callback::SleepStateChanged { sleeping: false })
    })
    .await?;

    handle.power_on(slot).await?;
    wait_for(handle, printer, |c| matches!(c, Callback::CardConnected(_))).await?;
    Ok(())
}

/// Print callbacks until one matches `done`. Fails on session teardown.
async fn wait_for<F>(
    handle: &mut SessionHandle,
    printer: &mut Printer,
    mut done: F,
) -> Result<()>
where
    F: FnMut(&Callback) -> bool,
{
    let callbacks = handle
        .recv_until(WAIT, |c| done(c) || *c == Callback::SessionClosed)
        .await?;
    printer.dispatch_all(&callbacks);

    match callbacks.last() {
        Some(last) if done(last) => Ok(()),
        _ => bail!("session closed unexpectedly"),
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            SessionConfig::from_json(&json)?
        }
        None => SessionConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.response_timeout_ms = Some(ms);
        config.validate()?;
    }
    Ok(config)
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    hex::decode(&cleaned).with_context(|| format!("invalid hex: {text}"))
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}
