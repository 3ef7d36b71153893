use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use edgetun_uapi::transport::socket_path;
use edgetun_uapi::{ControlRequest, ControlResponse, GetScope, TunnelConfiguration, UapiClient};
use serde::Serialize;
use shared_utils::logging::{init_logging, LogOptions};
use std::fmt::Write as _;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  edgetunctl -i ZitiTUN show\n  edgetunctl -i ZitiTUN --output json peers\n  edgetunctl -i ZitiTUN set peer.conf")]
struct Args {
    /// Log level
    #[arg(short, long, value_enum, default_value = "warn", env = "EDGETUN_LOG_LEVEL")]
    log_level: LogLevelArg,

    /// Interface whose control socket to use
    #[arg(short, long, default_value = "edgetun0")]
    interface: String,

    /// Directory holding the control sockets
    #[arg(long, default_value = "/var/run/edgetun", env = "EDGETUN_SERVICE_RUNTIME_DIR")]
    runtime_dir: PathBuf,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the interface and its peers
    Show,
    /// Show peers only
    Peers,
    /// Apply set-request lines read from a file, or stdin when omitted
    Set {
        file: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct SetResult {
    interface: String,
    errno: i32,
}

fn render_table(config: &TunnelConfiguration, scope: GetScope) -> String {
    let mut out = String::new();
    if scope == GetScope::All {
        let _ = writeln!(out, "interface: {}", config.interface_name);
        let _ = writeln!(out, "  listening port: {}", config.listen_port);
        let _ = writeln!(
            out,
            "  private key: {}",
            if config.private_key.is_some() { "(hidden)" } else { "(none)" }
        );
    }

    for peer in &config.peers {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "peer: {}", peer.public_key);
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "  endpoint: {endpoint}");
        }
        let allowed = if peer.allowed_ips.is_empty() {
            "(none)".to_string()
        } else {
            peer.allowed_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(out, "  allowed ips: {allowed}");
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "  persistent keepalive: every {keepalive} seconds");
        }
    }
    out
}

fn check(response: &ControlResponse) -> Result<()> {
    if !response.is_success() {
        bail!("request failed with errno={}", response.errno);
    }
    Ok(())
}

async fn query(client: &mut UapiClient, args: &Args, scope: GetScope) -> Result<()> {
    let response = client.request(&ControlRequest::Get(scope)).await?;
    check(&response)?;
    let config = TunnelConfiguration::from_get_entries(&args.interface, &response.entries)?;

    match args.output {
        OutputFormat::Table => print!("{}", render_table(&config, scope)),
        OutputFormat::Json => match scope {
            GetScope::All => println!("{}", serde_json::to_string_pretty(&config)?),
            GetScope::Peers => println!("{}", serde_json::to_string_pretty(&config.peers)?),
        },
    }
    Ok(())
}

async fn set(client: &mut UapiClient, args: &Args, file: Option<&PathBuf>) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    // Reject malformed input before it reaches the service
    let ops = ControlRequest::parse_set_body(&text)?;
    debug!("Sending {} set operations", ops.len());
    let response = client.request(&ControlRequest::Set(ops)).await?;

    match args.output {
        OutputFormat::Table => {
            check(&response)?;
            println!("{}: configuration applied", args.interface);
        }
        OutputFormat::Json => {
            let result = SetResult {
                interface: args.interface.clone(),
                errno: response.errno,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            check(&response)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(LogOptions {
        level: args.log_level.into(),
        ..Default::default()
    });

    let path = socket_path(&args.runtime_dir, &args.interface);
    let mut client = UapiClient::connect(&path)
        .await
        .with_context(|| format!("Is edgetund running for {}?", args.interface))?;

    match &args.command {
        Command::Show => query(&mut client, &args, GetScope::All).await?,
        Command::Peers => query(&mut client, &args, GetScope::Peers).await?,
        Command::Set { file } => set(&mut client, &args, file.as_ref()).await?,
    }

    let _ = client.close().await;
    Ok(())
}
