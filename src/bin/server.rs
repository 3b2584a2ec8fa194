//! Strata server binary.
//!
//! A line-oriented TCP boundary over the engine: `PUT <key> <value>`,
//! `GET <key>`, `DELETE <key>`. One thread per connection. All storage
//! semantics live in the engine; this file only parses lines and writes
//! responses.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use strata::{Config, Engine};

/// Strata server
#[derive(Parser, Debug)]
#[command(name = "strata-server")]
#[command(about = "Ordered key/value store over a line-oriented TCP protocol")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: String,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7379")]
    listen: String,

    /// Memtable flush threshold in MiB
    #[arg(short = 'm', long, default_value = "64")]
    memtable_mb: usize,

    /// Fsync the WAL on every write
    #[arg(long)]
    sync_on_write: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    tracing::info!("Strata server v{}", strata::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);

    let config = Config::new(&args.data_dir)
        .memtable_threshold_bytes(args.memtable_mb * 1024 * 1024)
        .sync_on_write(args.sync_on_write);

    let engine = match Engine::open_with_config(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!("Failed to open engine: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&args.listen) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {e}", args.listen);
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on {}", args.listen);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &engine) {
                        tracing::debug!("Connection ended: {e}");
                    }
                });
            }
            Err(e) => tracing::warn!("Accept failed: {e}"),
        }
    }
}

fn handle_client(stream: TcpStream, engine: &Engine) -> std::io::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::debug!("Client connected: {peer}");

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let response = dispatch(engine, line.trim_end_matches(['\r', '\n']));
        writer.write_all(response.as_bytes())?;
    }
}

fn dispatch(engine: &Engine, line: &str) -> String {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest),
        None => (line, ""),
    };

    match command {
        "PUT" => {
            let Some((key, value)) = rest.split_once(' ') else {
                return "ERROR\n".to_string();
            };
            match engine.put(key.as_bytes(), value.as_bytes()) {
                Ok(()) => "OK\n".to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "PUT failed");
                    "ERROR\n".to_string()
                }
            }
        }
        "GET" => match engine.get(rest.as_bytes()) {
            Ok(Some(value)) => {
                let mut response = String::from_utf8_lossy(&value).into_owned();
                response.push('\n');
                response
            }
            Ok(None) => "NOT_FOUND\n".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "GET failed");
                "ERROR\n".to_string()
            }
        },
        "DELETE" => match engine.delete(rest.as_bytes()) {
            Ok(()) => "OK\n".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "DELETE failed");
                "ERROR\n".to_string()
            }
        },
        _ => "UNKNOWN_COMMAND\n".to_string(),
    }
}
