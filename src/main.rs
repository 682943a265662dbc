//! Shardlink - Client-Connection Engine for Persistent Game Servers
//!
//! This is the entry point for the demo chat shard.
//! It sets up the TCP listener and the connection engine, then hands every
//! accepted client to its own read task.

use shardlink::chat::{ChatProtocol, ChatWorld};
use shardlink::connection::{handle_connection, Connection};
use shardlink::engine::{ConnectionEngine, EngineConfig, HandlerError};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Require the seed handshake from clients
    encryption: bool,
    /// Join buffer flush interval in milliseconds
    flush_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: shardlink::DEFAULT_HOST.to_string(),
            port: shardlink::DEFAULT_PORT,
            encryption: false,
            flush_ms: 333,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    if i + 1 < args.len() {
                        config.host = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --host requires a value");
                        std::process::exit(1);
                    }
                }
                "--port" | "-p" => {
                    if i + 1 < args.len() {
                        config.port = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid port number");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --port requires a value");
                        std::process::exit(1);
                    }
                }
                "--flush-ms" => {
                    if i + 1 < args.len() {
                        config.flush_ms = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid flush interval");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --flush-ms requires a value");
                        std::process::exit(1);
                    }
                }
                "--encryption" | "-e" => {
                    config.encryption = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("Shardlink version {}", shardlink::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            join_flush_interval: Duration::from_millis(self.flush_ms),
            ..EngineConfig::default()
        }
    }
}

fn print_help() {
    println!(
        r#"
Shardlink - Client-Connection Engine for Persistent Game Servers

USAGE:
    shardlink [OPTIONS]

OPTIONS:
    -h, --host <HOST>      Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>      Port to listen on (default: 2593)
    -e, --encryption       Require the 4-byte seed handshake
        --flush-ms <MS>    Join buffer flush interval (default: 333)
    -v, --version          Print version information
        --help             Print this help message

EXAMPLES:
    shardlink                      # Start on 127.0.0.1:2593
    shardlink --port 2594          # Start on port 2594
    shardlink --host 0.0.0.0 -e    # All interfaces, seeded encryption

PROTOCOL:
    Every frame is a 1-byte opcode followed by its payload.
    0x01 Login (30-byte name), 0x02 Say (i32 length + UTF-8), 0x03 Ping (u32)
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
Shardlink v{} - Client-Connection Engine
──────────────────────────────────────────────────────────────
Chat shard started on {}
Encryption: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        shardlink::VERSION,
        config.bind_address(),
        if config.encryption { "seeded" } else { "off" }
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    // The world every packet handler runs under
    let world = Arc::new(Mutex::new(ChatWorld::default()));
    let protocol = ChatProtocol {
        encryption: config.encryption,
    };
    let engine = ConnectionEngine::start(protocol, world, config.engine_config());

    // Bind the TCP listener
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    // A fatal handler error stops the server like Ctrl+C does
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<HandlerError>(1);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&engine), fatal_tx) => {}
        Some(e) = fatal_rx.recv() => {
            error!("Fatal error, stopping server: {}", e);
        }
        _ = shutdown => {}
    }

    // Let the send worker drain what handlers already queued
    let _ = tokio::time::timeout(Duration::from_secs(2), engine.wait_for_all_sent()).await;
    engine.shutdown();

    let stats = engine.stats();
    info!(
        connections = stats.connections_opened.load(Ordering::Relaxed),
        packets = stats.packets_handled.load(Ordering::Relaxed),
        bytes_sent = stats.bytes_sent.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(
    listener: TcpListener,
    engine: Arc<ConnectionEngine<ChatProtocol>>,
    fatal_tx: mpsc::Sender<HandlerError>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                let (reader, writer) = stream.into_split();
                let conn = Connection::open(&engine, writer, Some(addr));
                let fatal_tx = fatal_tx.clone();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, reader).await {
                        let _ = fatal_tx.send(e).await;
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
