//! OCPP Server Node - CLI for the OCPP 1.6 central system
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:9000, subprotocol ocpp1.6)
//! ocpp-server
//!
//! # Custom port and heartbeat interval
//! ocpp-server --port 9100 --heartbeat-interval 300
//!
//! # Close sessions that send unidentifiable frames
//! ocpp-server --strict-frames --log-level debug
//! ```
//!
//! Stations connect to `ws://<host>:<port>/<station_id>`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use ocpp_engine::{
    handlers, BootNotificationConfig, CentralSystem, MalformedFramePolicy, ServerConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 1.6 central system accepting charge point connections
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Accepted subprotocol, in order of preference (can be repeated)
    #[arg(long = "subprotocol", default_value = "ocpp1.6")]
    subprotocols: Vec<String>,

    /// Deadline for server-initiated requests, in seconds
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Heartbeat interval returned in BootNotification, in seconds
    #[arg(long, default_value = "10")]
    heartbeat_interval: i32,

    /// Close sessions on unidentifiable frames instead of dropping them
    #[arg(long)]
    strict_frames: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Server - OCPP 1.6 Central System           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:       {:<46} ║", bind_addr);
    println!("║  Subprotocols: {:<46} ║", truncate(&args.subprotocols.join(", "), 46));
    println!("║  Heartbeat:    {:<46} ║", format!("{} s", args.heartbeat_interval));
    println!("║  Timeout:      {:<46} ║", format!("{} s", args.request_timeout_secs));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = ServerConfig::new(bind_addr)
        .with_subprotocols(args.subprotocols)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs));

    if args.strict_frames {
        config = config.with_malformed_frames(MalformedFramePolicy::Close);
    }

    let boot = BootNotificationConfig {
        interval_secs: args.heartbeat_interval,
        ..Default::default()
    };
    let registry = handlers::default_registry(boot);
    info!("Registered actions: {:?}", registry.actions());

    let server = CentralSystem::new(config, registry);
    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
