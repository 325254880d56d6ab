//! voc - Command-line tool for Volvo On Call vehicles
//!
//! One-shot commands read vehicle state or send a command and wait for its
//! outcome; `voc mqtt` bridges all vehicles to an MQTT broker.

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use voc_core::{CommandKind, NoGeocoder};
use voc_runtime::{CommandInvoker, InvokerConfig};

use crate::config::Overrides;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "voc")]
#[command(author, version, about = "Volvo On Call command-line client")]
#[command(propagate_version = true)]
struct Cli {
    /// VOC username
    #[arg(short, long, env = "VOC_USERNAME")]
    user: Option<String>,

    /// VOC password
    #[arg(short, long = "pass", env = "VOC_PASSWORD", hide_env_values = true)]
    pass: Option<String>,

    /// VIN or registration number [default: first vehicle]
    #[arg(long, env = "VOC_VIN")]
    vin: Option<String>,

    /// Service region (na, cn)
    #[arg(long, env = "VOC_REGION")]
    region: Option<String>,

    /// Service URL, overrides the region
    #[arg(long, env = "VOC_SERVICE_URL")]
    service_url: Option<String>,

    /// Configuration file path [default: ~/.config/voc.conf]
    #[arg(short, long, env = "VOC_CONFIG")]
    config: Option<PathBuf>,

    /// Refuse to send commands to vehicles
    #[arg(long)]
    read_only: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List vehicles on the account
    List,

    /// Show the state of a vehicle
    Status,

    /// Print all attributes, or one by dotted path (e.g. doors.hoodOpen)
    Print {
        attribute: Option<String>,
    },

    /// Show the trip journal
    Trips,

    /// Lock the vehicle
    Lock,

    /// Unlock the vehicle
    Unlock,

    /// Control the parking heater
    Heater {
        #[command(subcommand)]
        action: Toggle,
    },

    /// Control remote engine start
    Engine {
        #[command(subcommand)]
        action: EngineAction,
    },

    /// Flash the lights and sound the horn
    HonkAndBlink,

    /// Call a vehicle service by name
    Call {
        /// Service name, e.g. preclimatization/start
        method: String,

        /// Parameters as JSON object
        params: Option<String>,
    },

    /// Write Prometheus metrics for every vehicle to a textfile
    Metrics {
        /// Output file, replaced atomically
        file: PathBuf,
    },

    /// Publish vehicle state to MQTT and accept commands from it
    Mqtt {
        /// Broker URL (mqtt[s]://user:pass@host:port) [default: from mosquitto_pub config]
        #[arg(long, env = "VOC_MQTT_URL")]
        mqtt_url: Option<String>,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum Toggle {
    Start,
    Stop,
}

#[derive(Subcommand, Clone, Copy)]
enum EngineAction {
    Start {
        /// Runtime in minutes
        #[arg(long, default_value_t = voc_core::DEFAULT_ENGINE_RUNTIME)]
        runtime: u32,
    },
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let file_config = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };
    let mqtt_url = match &cli.command {
        Commands::Mqtt { mqtt_url } => mqtt_url.clone(),
        _ => None,
    };
    let config = config::merge_with_args(
        file_config,
        Overrides {
            username: cli.user.clone(),
            password: cli.pass.clone(),
            vin: cli.vin.clone(),
            region: cli.region.clone(),
            service_url: cli.service_url.clone(),
            mqtt_url,
            read_only: cli.read_only,
        },
    );

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);
    let registry = commands::connect(&config).await?;

    match &cli.command {
        Commands::List => commands::list(&registry, &ctx).await?,

        Commands::Status => {
            let vehicle = commands::select_vehicle(&registry, config.vin.as_deref())?;
            commands::status(&registry, &vehicle, &NoGeocoder, &ctx).await?;
        }

        Commands::Print { attribute } => {
            let vehicle = commands::select_vehicle(&registry, config.vin.as_deref())?;
            commands::print(&registry, &vehicle, attribute.as_deref(), &ctx).await?;
        }

        Commands::Trips => {
            let vehicle = commands::select_vehicle(&registry, config.vin.as_deref())?;
            commands::trips(&registry, &vehicle, &ctx).await?;
        }

        Commands::Metrics { file } => commands::metrics(&registry, file, &ctx).await?,

        Commands::Mqtt { .. } => commands::mqtt(&config, registry, &ctx).await?,

        command => {
            let (kind, params) = command_kind(command)?;
            let vehicle = commands::select_vehicle(&registry, config.vin.as_deref())?;
            let invoker = Arc::new(CommandInvoker::new(
                registry.clone(),
                InvokerConfig::from(&config),
            ));
            commands::invoke(&invoker, &vehicle, kind, params, &ctx).await?;
        }
    }

    Ok(())
}

/// The remote command a subcommand stands for
fn command_kind(command: &Commands) -> Result<(CommandKind, Option<serde_json::Value>)> {
    let request = match command {
        Commands::Lock => (CommandKind::Lock, None),
        Commands::Unlock => (CommandKind::Unlock, None),
        Commands::Heater { action } => match action {
            Toggle::Start => (CommandKind::HeaterStart, None),
            Toggle::Stop => (CommandKind::HeaterStop, None),
        },
        Commands::Engine { action } => match action {
            EngineAction::Start { runtime } => (
                CommandKind::EngineStart,
                Some(serde_json::json!({ "runtime": runtime })),
            ),
            EngineAction::Stop => (CommandKind::EngineStop, None),
        },
        Commands::HonkAndBlink => (CommandKind::HonkAndBlink, None),
        Commands::Call { method, params } => (
            CommandKind::call(method),
            commands::actions::parse_params(params.as_deref())?,
        ),
        _ => anyhow::bail!("not a vehicle command"),
    };
    Ok(request)
}
