//! Load generator for the numlog server.
//!
//! Opens N connections and writes random nine digit numbers continuously
//! for a fixed duration, counting generated numbers and failed writes. With
//! `--require`, the exit code reflects whether the averaged throughput met
//! the requirement. Not part of the protocol contract.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

struct Args {
    addr: String,
    clients: usize,
    seconds: u64,
    require: Option<u64>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4000".to_string(),
            clients: 5,
            seconds: 30,
            require: None,
        }
    }
}

#[derive(Default)]
struct Tally {
    generated: AtomicU64,
    failed: AtomicU64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: numlog-loadgen [--addr <host:port>] [--clients <n>] [--seconds <n>] [--require <avg-per-10s>]"
            );
            return ExitCode::from(2);
        }
    };

    let tally = Arc::new(Tally::default());
    let mut workers = Vec::with_capacity(args.clients);
    for id in 0..args.clients {
        let addr = args.addr.clone();
        let tally = Arc::clone(&tally);
        workers.push(tokio::spawn(client_loop(addr, tally, id)));
    }

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    for worker in &workers {
        worker.abort();
    }

    let generated = tally.generated.load(Ordering::Relaxed);
    let failed = tally.failed.load(Ordering::Relaxed);
    let average = generated * 10 / args.seconds.max(1);

    println!("Total numbers generated: {generated}");
    println!("Total writes failed: {failed}");
    println!("Average in 10 sec: {average}");

    if let Some(required) = args.require {
        if average < required {
            eprintln!("Requirement ({required} avg per 10 secs) not met");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

/// Write random nine digit numbers until aborted.
async fn client_loop(addr: String, tally: Arc<Tally>, id: usize) {
    let mut conn = match TcpStream::connect(&addr).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("client {id}: connect to {addr} failed: {e}");
            return;
        }
    };

    loop {
        let number: u32 = rand::thread_rng().gen_range(0..=999_999_999);
        let payload = format!("{number:09}\n");
        tally.generated.fetch_add(1, Ordering::Relaxed);
        if conn.write_all(payload.as_bytes()).await.is_err() {
            tally.failed.fetch_add(1, Ordering::Relaxed);
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
                parsed.addr = args.get(i).ok_or("--addr requires a value")?.clone();
            }
            "--clients" => {
                i += 1;
                let value = args.get(i).ok_or("--clients requires a value")?;
                parsed.clients = value
                    .parse()
                    .map_err(|_| format!("invalid client count: {value}"))?;
            }
            "--seconds" => {
                i += 1;
                let value = args.get(i).ok_or("--seconds requires a value")?;
                parsed.seconds = value
                    .parse()
                    .map_err(|_| format!("invalid duration: {value}"))?;
            }
            "--require" => {
                i += 1;
                let value = args.get(i).ok_or("--require requires a value")?;
                parsed.require = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid requirement: {value}"))?,
                );
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("numlog-loadgen")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args.addr, "127.0.0.1:4000");
        assert_eq!(args.clients, 5);
        assert_eq!(args.seconds, 30);
        assert_eq!(args.require, None);
    }

    #[test]
    fn parses_all_flags() {
        let args = parse_args(&argv(&[
            "--addr",
            "10.0.0.1:4000",
            "--clients",
            "10",
            "--seconds",
            "60",
            "--require",
            "2000000",
        ]))
        .unwrap();
        assert_eq!(args.addr, "10.0.0.1:4000");
        assert_eq!(args.clients, 10);
        assert_eq!(args.seconds, 60);
        assert_eq!(args.require, Some(2_000_000));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(parse_args(&argv(&["--rate", "100"])).is_err());
    }
}
