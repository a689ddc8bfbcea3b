//! Command line entry point for the handler drivers.
//!
//! ```bash
//! ph-driver list
//! ph-driver ports
//! ph-driver comm-test handler.toml
//! ph-driver status handler.toml get barcode 1
//! ph-driver run --cycles 10 --seed 42
//! ```
//!
//! Configuration files are TOML; `PH_` environment variables override single
//! keys (`PH_MODEL=TW3XX`).

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod cell;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cell::CellOptions;
use ph_core::logging::{self, OutputFormat, TracingConfig};
use ph_core::{load_handler_config, HandlerConfig};
use ph_frame::{CallReturn, Frame, PluginRegistry, PolicyEvents, SimulatedTester};
use serde::Serialize;
use tracing::Level;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handler used when `run` is given no configuration.
const DEFAULT_CELL: &str = r#"
driver_plugin = "mock"
model = "mock"
handler_site_ids = ["1", "2", "3", "4"]
mock_lot_size = 100
"#;

#[derive(Parser, Debug)]
#[command(name = "ph-driver")]
#[command(about = "Semiconductor test handler drivers", long_about = None)]
struct Cli {
    /// More output; repeat for trace level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log level, overrides -v
    #[arg(long, global = true, value_parser = logging::parse_log_level)]
    log_level: Option<Level>,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "pretty", global = true)]
    log_format: OutputFormat,

    /// Log the duration of every plugin call
    #[arg(long, global = true)]
    timings: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the linked handler plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List serial ports an RS232 handler can be attached to
    Ports,

    /// Check a configuration without connecting to the handler
    Validate { config: PathBuf },

    /// Connect and test communication with the handler
    CommTest { config: PathBuf },

    /// Read or write a handler status value
    Status {
        config: PathBuf,
        #[command(subcommand)]
        action: StatusAction,
    },

    /// Run a simulated test cell through one lot
    Run {
        /// Handler configuration; a four site mock handler when omitted
        config: Option<PathBuf>,

        /// Lot id passed to lot start
        #[arg(long, default_value = "")]
        lot: String,

        /// Stop after this many device cycles
        #[arg(long)]
        cycles: Option<u64>,

        /// Share of devices that pass
        #[arg(long, default_value_t = 0.9)]
        pass_rate: f64,

        /// Seed for the test results
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum StatusAction {
    /// Print a status value, e.g. `get barcode 1`
    Get {
        #[arg(num_args = 1.., required = true)]
        key: Vec<String>,
    },
    /// Set a status value, e.g. `set lot_id L42`
    Set { key: String, value: String },
}

fn registry() -> PluginRegistry {
    let registry = PluginRegistry::new();
    ph_driver_techwing::register(&registry);
    ph_driver_mirae::register(&registry);
    ph_driver_yac::register(&registry);
    ph_driver_ismeca::register(&registry);
    ph_driver_atom::register(&registry);
    ph_driver_spea::register(&registry);
    ph_driver_pyramid::register(&registry);
    ph_driver_mock::register(&registry);
    registry
}

fn load(path: &Path) -> Result<HandlerConfig> {
    load_handler_config(path).with_context(|| format!("loading {}", path.display()))
}

async fn open(registry: &PluginRegistry, config: HandlerConfig) -> Result<(Frame, Arc<SimulatedTester>)> {
    let tester = Arc::new(SimulatedTester::new());
    let frame = registry
        .open_frame(config, tester.clone(), Arc::new(PolicyEvents::new()))
        .await?;
    Ok((frame, tester))
}

#[derive(Debug, Serialize)]
struct PluginListing {
    driver_plugin: String,
    name: String,
    models: Vec<String>,
    operations: Vec<&'static str>,
}

fn listing(registry: &PluginRegistry) -> Vec<PluginListing> {
    registry
        .list_factories()
        .iter()
        .filter_map(|driver_type| registry.factory_info(driver_type))
        .map(|info| PluginListing {
            driver_plugin: info.driver_type,
            name: info.name,
            models: info.models,
            operations: info.availability.iter().map(|op| op.call_name()).collect(),
        })
        .collect()
}

fn list(registry: &PluginRegistry, json: bool) -> Result<()> {
    let plugins = listing(registry);
    if json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
        return Ok(());
    }
    for plugin in plugins {
        println!(
            "{:<10} {:<32} {}",
            plugin.driver_plugin,
            plugin.name,
            plugin.models.join(", ")
        );
    }
    Ok(())
}

fn ports() -> Result<()> {
    let ports = serialport::available_ports().context("cannot enumerate serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{:<20} usb {:04x}:{:04x} {}",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            other => println!("{:<20} {:?}", port.port_name, other),
        }
    }
    Ok(())
}

fn validate(registry: &PluginRegistry, path: &Path) -> Result<()> {
    let config = load(path)?;
    let info = registry
        .factory_info(&config.driver_plugin)
        .with_context(|| format!("no plugin registered for '{}'", config.driver_plugin))?;
    registry.validate(&config)?;
    println!(
        "{}: {} model {}, {} sites",
        path.display(),
        info.name,
        config.model,
        config.site_count()
    );
    Ok(())
}

async fn comm_test(registry: &PluginRegistry, path: &Path) -> Result<()> {
    let (mut frame, _tester) = open(registry, load(path)?).await?;
    let answer = frame.comm_test().await;
    let id = frame.equipment_id().await.value;
    frame.shutdown().await;
    match (answer.ret, answer.value) {
        (CallReturn::Pass, Some(false)) => bail!("handler did not accept communication"),
        (CallReturn::Pass, _) => {
            println!("communication ok{}", id.map(|id| format!(": {}", id)).unwrap_or_default());
            Ok(())
        }
        (other, _) => bail!("communication test returned {:?}", other),
    }
}

async fn status(registry: &PluginRegistry, path: &Path, action: StatusAction) -> Result<()> {
    let (mut frame, _tester) = open(registry, load(path)?).await?;
    if frame.driver_start().await != CallReturn::Pass {
        frame.shutdown().await;
        bail!("driver start failed");
    }
    let result = match action {
        StatusAction::Get { key } => {
            let answer = frame.get_status(&key.join(" ")).await;
            match (answer.ret, answer.value) {
                (CallReturn::Pass, Some(value)) => {
                    println!("{}", value);
                    Ok(())
                }
                (ret, _) => Err(anyhow::anyhow!("get status returned {:?}", ret)),
            }
        }
        StatusAction::Set { key, value } => match frame.set_status(&key, &value).await {
            CallReturn::Pass => Ok(()),
            ret => Err(anyhow::anyhow!("set status returned {:?}", ret)),
        },
    };
    frame.driver_done().await;
    frame.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_config = match cli.log_level {
        Some(level) => TracingConfig::new(level),
        None => TracingConfig::from_verbosity(cli.verbose),
    };
    logging::init(
        log_config
            .with_format(cli.log_format)
            .with_span_events(cli.timings)
            .with_ansi(std::io::stdout().is_terminal()),
    )
    .map_err(anyhow::Error::msg)?;

    let registry = registry();
    match cli.command {
        Commands::List { json } => list(&registry, json),
        Commands::Ports => ports(),
        Commands::Validate { config } => validate(&registry, &config),
        Commands::CommTest { config } => comm_test(&registry, &config).await,
        Commands::Status { config, action } => status(&registry, &config, action).await,
        Commands::Run {
            config,
            lot,
            cycles,
            pass_rate,
            seed,
        } => {
            let config = match config {
                Some(path) => load(&path)?,
                None => HandlerConfig::from_toml_str(DEFAULT_CELL)?,
            };
            let (mut frame, tester) = open(&registry, config).await?;
            let options = CellOptions {
                lot_id: lot,
                cycles,
                pass_rate,
                seed,
            };
            let summary = tokio::select! {
                summary = cell::run_lot(&mut frame, &tester, &options) => summary?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted");
                    return Ok(());
                }
            };
            println!(
                "{} device cycles, {} devices tested, {} passed{}",
                summary.cycles,
                summary.tested,
                summary.passed,
                if summary.lot_done { ", lot ended by handler" } else { "" }
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_plugin_is_registered() {
        assert_eq!(
            registry().list_factories(),
            ["atom", "ismeca", "mirae", "mock", "pyramid", "spea", "techwing", "yac"]
        );
    }

    #[test]
    fn listing_names_operations() {
        let plugins = listing(&registry());
        let mock = plugins
            .iter()
            .find(|p| p.driver_plugin == "mock")
            .unwrap();
        assert_eq!(mock.models, vec!["MOCK".to_string()]);
        assert!(mock.operations.contains(&"getstatus-plugin"));
        let json = serde_json::to_value(&plugins).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(8));
    }

    #[test]
    fn parses_status_get_with_site() {
        let cli = Cli::try_parse_from(["ph-driver", "-vv", "status", "h.toml", "get", "barcode", "2"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_level, None);
        match cli.command {
            Commands::Status {
                action: StatusAction::Get { key },
                ..
            } => assert_eq!(key.join(" "), "barcode 2"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn log_level_is_parsed() {
        let cli = Cli::try_parse_from(["ph-driver", "list", "--log-level", "WARN"]).unwrap();
        assert_eq!(cli.log_level, Some(Level::WARN));
        assert!(Cli::try_parse_from(["ph-driver", "list", "--log-level", "loud"]).is_err());
    }

    #[test]
    fn default_cell_is_a_valid_mock() {
        let config = HandlerConfig::from_toml_str(DEFAULT_CELL).unwrap();
        assert!(registry().validate(&config).is_ok());
        assert_eq!(config.site_count(), 4);
    }
}
