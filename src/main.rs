use anyhow::Context;
use clap::Parser;
use grblbridge::{init_logging, spawn_client_reader, Daemon, BUILD_DATE, VERSION};
use grblbridge_communication::list_ports;
use grblbridge_settings::{DaemonSettings, MachineConfig};
use std::path::PathBuf;

/// Bridge a client on stdin/stdout to a GRBL controller on a serial port
#[derive(Debug, Parser)]
#[command(name = "grblbridge", version)]
struct Args {
    /// Machine configuration file (JSON or TOML)
    #[arg(long, value_name = "PATH")]
    machine_config: Option<PathBuf>,

    /// Daemon settings file (TOML)
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Serial port to open at startup
    #[arg(long, value_name = "DEVICE")]
    port: Option<String>,

    /// Print available serial ports as JSON and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging()?;
    tracing::info!(version = VERSION, build_date = BUILD_DATE, "grblbridge starting");

    if args.list_ports {
        let ports = list_ports().context("listing serial ports")?;
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    let settings_path = match args.settings {
        Some(path) => path,
        None => DaemonSettings::default_path()?,
    };
    let settings = DaemonSettings::load_or_default(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;

    let machine_config = args
        .machine_config
        .or_else(|| settings.default_machine_config.clone())
        .map(|path| {
            MachineConfig::load_from_file(&path)
                .with_context(|| format!("loading machine config from {}", path.display()))
        })
        .transpose()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let mut daemon = Daemon::new(settings, machine_config);
        spawn_client_reader(tokio::io::stdin(), daemon.sender());
        if let Some(port) = args.port {
            daemon.open_port(&port);
        }
        daemon.run(tokio::io::stdout()).await
    })
}
