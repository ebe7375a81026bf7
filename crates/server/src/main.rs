//! The Tessera server binary.

use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use tessera_server::{Server, ServerConfig};
use tessera_storage::SegmentGeometry;

/// In-memory transactional object store server.
#[derive(Debug, Parser)]
#[command(name = "tessera-server", version, about)]
struct Args {
    /// Path of the listening Unix-domain socket.
    #[arg(long, default_value = "/tmp/tessera.sock")]
    socket: PathBuf,

    /// Write-ahead log file. Ignored with --disable-persistence.
    #[arg(long, default_value = "tessera.wal")]
    wal: PathBuf,

    /// Run without a durable log.
    #[arg(long)]
    disable_persistence: bool,

    /// Number of locator slots.
    #[arg(long)]
    max_locators: Option<usize>,

    /// Arena capacity in 8-byte words.
    #[arg(long)]
    arena_words: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut geometry = SegmentGeometry::default();
    if let Some(max_locators) = args.max_locators {
        geometry.max_locators = max_locators;
    }
    if let Some(arena_words) = args.arena_words {
        geometry.arena_words = arena_words;
    }

    let mut config = ServerConfig::new(args.socket);
    config.geometry = geometry;
    if !args.disable_persistence {
        config = config.with_wal(args.wal);
    }

    let handle = match Server::start(config) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "server failed to start");
            std::process::exit(1);
        }
    };

    // Serve until stdin closes (e.g. the supervisor hangs up), then shut
    // down gracefully. SIGTERM/SIGINT terminate the process directly; the
    // server keeps no on-disk state that needs cleanup beyond the WAL,
    // which recovery handles.
    let mut sink = [0u8; 64];
    let mut stdin = std::io::stdin();
    loop {
        match stdin.read(&mut sink) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    handle.shutdown();
}
