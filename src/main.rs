use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nut_bridge::adapter::Adapter;
use nut_bridge::config::Settings;
use nut_bridge::control;
use nut_bridge::error::AdapterError;
use nut_bridge::mailer::Mailer;
use nut_bridge::store::{MemoryStore, StateStore};
use nut_bridge::ups::TcpClient;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML file with the upsd connection settings.
    #[clap(short, long, default_value = "nut.toml")]
    config: PathBuf,

    /// Log every state write.
    #[clap(short, long)]
    verbose: bool,

    /// Poll once, print the state tree as JSON and exit.
    #[clap(long)]
    once: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: Args) -> Result<(), AdapterError> {
    let settings = Settings::load(&args.config)?;
    // Checked here as well so a bad port fails before anything is spawned.
    settings.port()?;
    let control_addr = settings.control_addr()?;

    let client = TcpClient::new(settings.io_timeout());
    let mailer = settings.mailer.clone().map(Mailer::new).transpose()?;
    let stop = Arc::new(AtomicBool::new(false));
    let identity = settings.ups_identity();

    let mut adapter = Adapter::new(settings, Box::new(client), MemoryStore::new(), stop.clone());
    if let Some(mailer) = mailer {
        adapter = adapter.with_alerts(Box::new(mailer));
    }

    if args.once {
        adapter.start()?;
        println!("{:#}", adapter.store().dump());
        adapter.unload();
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    control::stop_on_signals(tx.clone(), stop.clone()).map_err(AdapterError::Control)?;
    if let Some(addr) = control_addr {
        control::spawn(addr, tx.clone(), stop).map_err(AdapterError::Control)?;
    }

    info!("NUT bridge running for {}", identity);
    adapter.start()?;
    adapter.run(rx)?;
    drop(tx);
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!("{}", e);
        exit(e.exit_code());
    }
}
