//! adcore CLI — connects to an ADC/NMDC hub and prints the events the
//! client registry produces. Everything interesting lives in the library;
//! this binary is just process wiring: config, identity persistence,
//! logging, and a ctrl-c-triggered shutdown.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use adcore::{Cid, ClientRegistry, Config, HubConnectOptions, HubEvent, LocalIdentity, Pid};

#[derive(Parser)]
#[command(name = "adcore")]
#[command(version)]
#[command(about = "ADC/NMDC hub session and peer connection core")]
struct Cli {
    /// Override the state directory (identity, certs, config.json).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a hub and log events until interrupted.
    Connect {
        /// Hub URL, e.g. `adc://hub.example.com:5000` or `nmdcs://hub.example.com`.
        url: String,
        /// Nick to log in with; defaults to the configured nick.
        #[arg(long)]
        nick: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the current configuration.
    Config,
    /// Print this client's own CID (generating an identity if none exists).
    ShowCid,
    /// Regenerate the self-signed identity certificate.
    GenCert,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let state_dir = cli
        .state_dir
        .unwrap_or_else(|| Config::default().state_dir);
    std::fs::create_dir_all(&state_dir).with_context(|| format!("creating state dir {}", state_dir.display()))?;

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;

    match cli.command {
        Commands::Connect { url, nick, password } => runtime.block_on(run_connect(&state_dir, url, nick, password)),
        Commands::Config => {
            let config = Config::load(&state_dir)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ShowCid => {
            let (cid, _pid) = load_or_create_identity(&state_dir)?;
            println!("{}", cid.to_base32());
            Ok(())
        }
        Commands::GenCert => {
            let (cid, _pid) = load_or_create_identity(&state_dir)?;
            let config = Config::load(&state_dir)?;
            let cert = adcore::crypto::certs::generate_self_signed(&cid)?;
            adcore::crypto::certs::persist(&cert, &config.certs_dir()?)?;
            println!("wrote cert to {}", config.certs_dir()?.display());
            Ok(())
        }
    }
}

async fn run_connect(state_dir: &Path, url: String, nick: Option<String>, password: Option<String>) -> Result<()> {
    let config = Config::load(state_dir)?;
    let (own_cid, own_pid) = load_or_create_identity(state_dir)?;
    let nick = nick.unwrap_or(config.nick);

    let udp = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:0").await.context("binding search UDP socket")?);
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(256);
    let registry = ClientRegistry::new(own_cid, own_pid, udp, events_tx);

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_flag = shutdown.clone();
    ctrlc::set_handler(move || ctrlc_flag.store(true, Ordering::SeqCst)).context("installing ctrl-c handler")?;

    let local_identity = LocalIdentity {
        nick: nick.clone(),
        description: config.description,
        email: config.email,
        upload_slots: config.slots.upload_slots,
        free_slots: config.slots.upload_slots,
        ..LocalIdentity::default()
    };
    let opts = HubConnectOptions {
        url: url.clone(),
        nick,
        own_cid,
        own_pid,
        password,
        expected_keyprint: None,
        local_identity,
    };
    registry.create_client(opts).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    log::info!("connecting to {url}");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("shutting down");
            registry.put_client(&url).await;
            break;
        }
        match tokio::time::timeout(std::time::Duration::from_millis(200), events_rx.recv()).await {
            Ok(Some(event)) => log_hub_event(&event),
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    Ok(())
}

fn log_hub_event(event: &HubEvent) {
    log::info!("{event:?}");
}

/// Reads `identity.pid` (24 raw PID bytes) from the state directory,
/// generating and persisting a new one on first run.
fn load_or_create_identity(state_dir: &Path) -> Result<(Cid, Pid)> {
    let path = state_dir.join("identity.pid");
    let pid = match std::fs::read(&path) {
        Ok(bytes) if bytes.len() == adcore::constants::CID_LEN => {
            let mut buf = [0u8; 24];
            buf.copy_from_slice(&bytes);
            Pid(buf)
        }
        _ => {
            let pid = Pid::generate();
            let mut file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
            file.write_all(&pid.0)?;
            file.sync_all()?;
            pid
        }
    };
    let cid = Cid::from_pid(&pid);
    Ok((cid, pid))
}
