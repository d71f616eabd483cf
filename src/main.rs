use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use spwrap::config::{Config, ConfigLoader, LogFormat, LoggingConfig};
use spwrap::{Configuration, EventMask, EventSet, FlowControl, Mode, Parity, Port};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Inspect, configure and talk to serial ports.
#[derive(Parser, Debug)]
#[command(name = "spwrap", version, about, long_about = None)]
struct Cli {
    /// Settings file, instead of the standard search path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports and their identity
    List,

    /// Show identity and live line settings of a port
    Info {
        /// Device path or alias
        port: String,
    },

    /// Change line settings; with no options, apply the configured defaults
    Configure(ConfigureArgs),

    /// Write data and wait for it to be transmitted
    Send {
        port: String,
        data: String,
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Read bytes from a port
    Recv {
        port: String,
        /// Bytes to read
        #[arg(long, default_value_t = 64)]
        count: usize,
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        /// Print bytes as hex instead of text
        #[arg(long)]
        hex: bool,
    },

    /// Show the modem input lines
    Signals { port: String },

    /// Wait until any of the ports has input
    Watch {
        #[arg(required = true)]
        ports: Vec<String>,
        /// 0 waits indefinitely
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    port: String,
    #[arg(long)]
    baud: Option<u32>,
    #[arg(long, value_parser = clap::value_parser!(u8).range(5..=8))]
    bits: Option<u8>,
    #[arg(long, value_enum, ignore_case = true)]
    parity: Option<ParityArg>,
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
    stopbits: Option<u8>,
    #[arg(long, value_enum, ignore_case = true)]
    flowcontrol: Option<FlowArg>,
}

impl ConfigureArgs {
    fn is_empty(&self) -> bool {
        self.baud.is_none()
            && self.bits.is_none()
            && self.parity.is_none()
            && self.stopbits.is_none()
            && self.flowcontrol.is_none()
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "lowercase")]
enum ParityArg {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl From<ParityArg> for Parity {
    fn from(value: ParityArg) -> Self {
        match value {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
            ParityArg::Mark => Parity::Mark,
            ParityArg::Space => Parity::Space,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum FlowArg {
    None,
    XonXoff,
    RtsCts,
    DtrDsr,
}

impl From<FlowArg> for FlowControl {
    fn from(value: FlowArg) -> Self {
        match value {
            FlowArg::None => FlowControl::None,
            FlowArg::XonXoff => FlowControl::XonXoff,
            FlowArg::RtsCts => FlowControl::RtsCts,
            FlowArg::DtrDsr => FlowControl::DtrDsr,
        }
    }
}

fn main() -> CliResult {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    init_logging(&loader.config().logging);
    if let Some(path) = &loader.config_path {
        debug!("Using settings from {}", path.display());
    }

    let config = loader.into_config();
    let output = match cli.command {
        Command::List => list()?,
        Command::Info { port } => info(&config, &port)?,
        Command::Configure(args) => configure(&config, args)?,
        Command::Send {
            port,
            data,
            timeout_ms,
        } => send(&config, &port, &data, timeout_ms)?,
        Command::Recv {
            port,
            count,
            timeout_ms,
            hex,
        } => recv(&config, &port, count, timeout_ms, hex)?,
        Command::Signals { port } => signals(&config, &port)?,
        Command::Watch { ports, timeout_ms } => watch(&config, &ports, timeout_ms)?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_plain(&output);
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Render a JSON result as indented `key: value` lines.
fn print_plain(value: &Value) {
    fn walk(value: &Value, indent: usize) {
        let pad = "  ".repeat(indent);
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    match value {
                        Value::Object(_) | Value::Array(_) => {
                            println!("{pad}{key}:");
                            walk(value, indent + 1);
                        }
                        other => println!("{pad}{key}: {}", scalar(other)),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, indent);
                    if item.is_object() {
                        println!();
                    }
                }
            }
            other => println!("{pad}{}", scalar(other)),
        }
    }

    fn scalar(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => "-".to_string(),
            other => other.to_string(),
        }
    }

    walk(value, 0);
}

fn timeout(config: &Config, override_ms: Option<u64>) -> Duration {
    override_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.serial.default_timeout())
}

fn open(config: &Config, name: &str, mode: Mode) -> CliResult<Port> {
    let device = config.serial.resolve_port(name);
    let port = Port::by_name(&device)?;
    port.open(mode)?;
    info!("Opened {}", device);
    Ok(port)
}

fn identity(port: &Port) -> Value {
    json!({
        "name": port.name().ok(),
        "description": port.description().ok(),
        "transport": port.transport().ok().map(|t| t.to_string()),
        "usb_vid_pid": port
            .usb_vid_pid()
            .ok()
            .map(|(vid, pid)| format!("{vid:04x}:{pid:04x}")),
        "usb_manufacturer": port.usb_manufacturer().ok(),
        "usb_product": port.usb_product().ok(),
        "usb_serial": port.usb_serial().ok(),
        "bluetooth_address": port.bluetooth_address().ok(),
    })
}

fn line_settings(config: &Configuration) -> Value {
    json!({
        "baudrate": config.baudrate().ok(),
        "bits": config.bits().ok(),
        "parity": config.parity().ok(),
        "stopbits": config.stopbits().ok(),
        "rts": config.rts().ok(),
        "cts": config.cts().ok(),
        "dtr": config.dtr().ok(),
        "dsr": config.dsr().ok(),
        "xon_xoff": config.xon_xoff().ok(),
    })
}

fn list() -> CliResult<Value> {
    let ports = Port::list()?;
    Ok(Value::Array(ports.iter().map(identity).collect()))
}

fn info(config: &Config, name: &str) -> CliResult<Value> {
    let port = open(config, name, Mode::Read)?;
    let settings = port.config()?;
    let result = json!({
        "identity": identity(&port),
        "settings": line_settings(&settings),
    });
    port.close()?;
    Ok(result)
}

fn configure(config: &Config, args: ConfigureArgs) -> CliResult<Value> {
    let port = open(config, &args.port, Mode::ReadWrite)?;

    let changes = if args.is_empty() {
        debug!("No options given, applying configured defaults");
        config.serial.to_configuration(port.driver().clone())?
    } else {
        let changes = Configuration::create()?;
        if let Some(baud) = args.baud {
            changes.set_baudrate(baud)?;
        }
        if let Some(bits) = args.bits {
            changes.set_bits(bits)?;
        }
        if let Some(parity) = args.parity {
            changes.set_parity(parity.into())?;
        }
        if let Some(stopbits) = args.stopbits {
            changes.set_stopbits(stopbits)?;
        }
        if let Some(flow) = args.flowcontrol {
            changes.set_flowcontrol(flow.into())?;
        }
        changes
    };
    port.set_config(&changes)?;

    let result = line_settings(&port.config()?);
    port.close()?;
    Ok(result)
}

fn send(config: &Config, name: &str, data: &str, timeout_ms: Option<u64>) -> CliResult<Value> {
    let port = open(config, name, Mode::Write)?;
    let written = port.blocking_write(data.as_bytes(), timeout(config, timeout_ms))?;
    port.drain()?;
    port.close()?;
    Ok(json!({ "written": written, "requested": data.len() }))
}

fn recv(
    config: &Config,
    name: &str,
    count: usize,
    timeout_ms: Option<u64>,
    hex: bool,
) -> CliResult<Value> {
    let port = open(config, name, Mode::Read)?;
    let mut buf = vec![0u8; count];
    let read = port.blocking_read(&mut buf, timeout(config, timeout_ms))?;
    port.close()?;
    buf.truncate(read);

    let data = if hex {
        buf.iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        String::from_utf8_lossy(&buf).into_owned()
    };
    Ok(json!({ "read": read, "data": data }))
}

fn signals(config: &Config, name: &str) -> CliResult<Value> {
    let port = open(config, name, Mode::Read)?;
    let signals = port.signals()?;
    port.close()?;
    Ok(json!({
        "signals": signals.to_string(),
        "active": signals.labels(),
    }))
}

fn watch(config: &Config, names: &[String], timeout_ms: Option<u64>) -> CliResult<Value> {
    let ports = names
        .iter()
        .map(|name| open(config, name, Mode::Read))
        .collect::<CliResult<Vec<_>>>()?;

    let events = EventSet::create()?;
    for port in &ports {
        events.add_events(port, EventMask::RX_READY | EventMask::ERROR)?;
    }
    events.wait(timeout(config, timeout_ms))?;

    let mut waiting = serde_json::Map::new();
    for (name, port) in names.iter().zip(&ports) {
        waiting.insert(name.clone(), json!(port.input_waiting()?));
    }
    drop(events);
    for port in &ports {
        port.close()?;
    }
    Ok(Value::Object(waiting))
}
