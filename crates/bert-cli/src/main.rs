//! `bert` – starts the robot.
//!
//! 1. Loads `~/.bert/config.toml` (or the path given as the first argument
//!    or in `BERT_CONFIG`).  A broken file is fatal.
//! 2. Opens one serial port per configured bus, or simulated buses when
//!    `simulate` is set.
//! 3. Launches the hub and its subsystems, the WebSocket peripheral and the
//!    console.
//! 4. Intercepts **Ctrl-C** to shut the hub down and exit.
//!
//! `bert --init [path]` writes the default configuration and exits.
//! `bert --headless` runs without the console.

mod config;
mod terminal;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bert_hal::{ByteReceiver, DevicePort, SerialPort, SimulatedPort};
use bert_middleware::{NetworkPeripheral, ReplyBus};
use bert_runtime::telemetry::init_tracing;
use bert_runtime::{HubOptions, InternetClient, LocalResponder, NoKinematics, Wiring, launch};
use bert_types::{BertError, CommandKind, RequestEnvelope, RequestKind, Source, Target};
use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::terminal::Terminal;

#[derive(Parser, Debug)]
#[command(name = "bert")]
#[command(version, about = "Humanoid robot control middleware", long_about = None)]
struct Args {
    /// Configuration file. Defaults to `BERT_CONFIG` or `~/.bert/config.toml`.
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Write the default configuration and exit.
    #[arg(long)]
    init: bool,

    /// Run without the console.
    #[arg(long)]
    headless: bool,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(config::config_path)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _telemetry = init_tracing("bert");
    let config_path = args.config_path();

    if args.init {
        return match config::save_to(&Config::default(), &config_path) {
            Ok(()) => {
                println!("  Default configuration written to {}", config_path.display().to_string().bold());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", "Config error".red());
                ExitCode::FAILURE
            }
        };
    }

    print_banner();

    let cfg = match config::load_from(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };
    info!(path = %config_path.display(), robot = %cfg.robot.name, simulate = cfg.simulate, "configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {e}", "Failed to start the async runtime".red());
            return ExitCode::FAILURE;
        }
    };
    let history = config_path.parent().map(|dir| dir.join("history"));
    match runtime.block_on(run(cfg, history, args.headless)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "Startup failed".red());
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config, history: Option<PathBuf>, headless: bool) -> Result<(), BertError> {
    let registry = Arc::new(cfg.registry()?);
    let ports = open_ports(&cfg).await?;

    let internet = Arc::new(InternetClient::new(&cfg.ai.url, &cfg.ai.model).with_api_key(cfg.ai.api_key.clone()));
    let running = launch(Wiring {
        registry,
        catalog: Arc::new(cfg.catalog()),
        ports,
        internet,
        local: LocalResponder::new(cfg.robot.clone(), Box::new(NoKinematics)),
        bus: ReplyBus::default(),
        options: HubOptions {
            cadence: cfg.cadence(),
            normal_speed_pose: cfg.normal_speed_pose.clone(),
            ..HubOptions::default()
        },
    });

    // ── Ctrl-C ────────────────────────────────────────────────────────────
    let ctrlc_submit = running.submit.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        let shutdown =
            RequestEnvelope::new(RequestKind::Command(CommandKind::Shutdown), Target::All).with_source(Source::Terminal);
        if let Err(e) = ctrlc_submit.blocking_send(shutdown) {
            warn!(error = %e, "hub is gone, shutdown request dropped");
        }
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    // ── Peripherals ───────────────────────────────────────────────────────
    let network = NetworkPeripheral::new(running.submit.clone(), running.bus.clone())
        .with_port(cfg.network_port)
        .with_rate_limit(cfg.rate_limit);
    println!("  Listening for the tablet on port {}", network.port().to_string().bold());
    tokio::spawn(async move {
        if let Err(e) = network.run().await {
            error!(error = %e, "network peripheral stopped");
        }
    });

    if !headless {
        let mut console = Terminal::new(running.submit.clone(), &running.bus)?;
        if let Some(path) = history {
            console = console.with_history(path);
        }
        println!("  Type {} for a list of commands.\n", "help".bold().cyan());
        tokio::spawn(console.run());
    }

    if let Err(e) = running.hub.await {
        error!(error = %e, "hub task failed");
    }
    println!("{}", "  ✓ Bert is shut down.".green());
    Ok(())
}

/// One port per configured bus.
async fn open_ports(cfg: &Config) -> Result<Vec<(Box<dyn SerialPort>, ByteReceiver)>, BertError> {
    let mut ports: Vec<(Box<dyn SerialPort>, ByteReceiver)> = Vec::with_capacity(cfg.buses.len());
    for bus in &cfg.buses {
        if cfg.simulate {
            let motors: Vec<_> = cfg.motors.iter().filter(|m| m.bus == bus.name).cloned().collect();
            let (port, bytes) = SimulatedPort::new(bus.name.clone(), &motors);
            info!(bus = %bus.name, motors = motors.len(), "simulated bus ready");
            ports.push((Box::new(port), bytes));
        } else {
            let (port, bytes) = DevicePort::open(bus.name.clone(), &bus.device).await?;
            info!(bus = %bus.name, device = %bus.device.display(), "serial bus opened");
            ports.push((Box::new(port), bytes));
        }
    }
    Ok(ports)
}

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║                 BERT                 ║".bold().cyan());
    println!("{}", "  ║     humanoid control middleware      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
}
