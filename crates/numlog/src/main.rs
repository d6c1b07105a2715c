//! numlog server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use numlog::server::ServerConfig;
use numlog::service::{self, Service, ServiceConfig};

struct Args {
    addr: SocketAddr,
    log_file: PathBuf,
    max_connections: usize,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            addr: ServerConfig::default().addr,
            log_file: PathBuf::from("numbers.log"),
            max_connections: ServerConfig::default().max_connections,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: numlog [--addr <host:port>] [--log-file <path>] [--max-connections <n>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --addr <host:port>      Listen address [default: 0.0.0.0:4000]");
            eprintln!("  --log-file <path>       Accepted numbers log [default: numbers.log]");
            eprintln!("  --max-connections <n>   Concurrently serviced connections [default: 5]");
            return ExitCode::from(2);
        }
    };

    // The log starts fresh on every run; there is no replay of earlier logs.
    let destination = match tokio::fs::File::create(&args.log_file).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %args.log_file.display(), error = %e, "failed to create log file");
            return ExitCode::FAILURE;
        }
    };

    let config = ServiceConfig {
        server: ServerConfig {
            addr: args.addr,
            max_connections: args.max_connections,
        },
        ..ServiceConfig::default()
    };

    let service = match Service::bind(config, destination).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        service::shutdown_signal().await;
        signal_token.cancel();
    });

    match service.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_graceful() => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "service terminated");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                i += 1;
                let value = args.get(i).ok_or("--addr requires a value")?;
                parsed.addr = value
                    .parse()
                    .map_err(|_| format!("invalid listen address: {value}"))?;
            }
            "--log-file" => {
                i += 1;
                parsed.log_file = PathBuf::from(args.get(i).ok_or("--log-file requires a value")?);
            }
            "--max-connections" => {
                i += 1;
                let value = args.get(i).ok_or("--max-connections requires a value")?;
                parsed.max_connections = value
                    .parse()
                    .map_err(|_| format!("invalid connection count: {value}"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}
