use clap::Parser;
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

use fieldgate::GatewaySettings;

/// Modbus-to-MQTT industrial gateway
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(long, default_value = "fieldgate.toml")]
    config: PathBuf,

    /// Override the cloud broker URL from the config file
    #[arg(long)]
    cloud_url: Option<String>,

    /// Override the Modbus slave URL from the config file
    #[arg(long)]
    modbus_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut settings = match GatewaySettings::from_file(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    settings.apply_args(args.cloud_url, args.modbus_url);

    match fieldgate::gateway::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
