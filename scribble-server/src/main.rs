use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scribble_collab::auth::{AllowAnonymous, JwtVerifier, TokenVerifier};
use scribble_collab::hub::HubConfig;
use scribble_collab::persistence::DebouncePolicy;
use scribble_collab::server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "scribble-server")]
#[command(author, version, about = "Real-time sync server for Scribble boards", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SCRIBBLE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; omit to keep boards in memory only
    #[arg(long, env = "SCRIBBLE_STORAGE")]
    storage: Option<PathBuf>,

    /// HS256 secret shared with the account service
    #[arg(long, env = "SCRIBBLE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Quiet period before a changed board is saved, in milliseconds
    #[arg(long, env = "SCRIBBLE_SAVE_DELAY_MS", default_value_t = 5_000)]
    save_delay_ms: u64,

    /// Longest a changed board may stay unsaved, in milliseconds
    #[arg(long, env = "SCRIBBLE_SAVE_MAX_DELAY_MS", default_value_t = 60_000)]
    save_max_delay_ms: u64,

    /// How long an empty board stays loaded, in seconds
    #[arg(long, env = "SCRIBBLE_EVICTION_GRACE_SECS", default_value_t = 30)]
    eviction_grace_secs: u64,

    /// Frames buffered per connection before it is dropped
    #[arg(long, env = "SCRIBBLE_OUTBOUND_QUEUE", default_value_t = 256)]
    outbound_queue: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let debounce = DebouncePolicy {
            delay: Duration::from_millis(self.save_delay_ms),
            max_delay: Duration::from_millis(self.save_max_delay_ms),
            ..DebouncePolicy::default()
        };
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.storage.clone(),
            outbound_queue_capacity: self.outbound_queue,
            hub: HubConfig {
                debounce,
                eviction_grace: Duration::from_secs(self.eviction_grace_secs),
                ..HubConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    fn verifier(&self) -> Arc<dyn TokenVerifier> {
        match &self.jwt_secret {
            Some(secret) => Arc::new(JwtVerifier::new(secret)),
            None => {
                warn!("SCRIBBLE_JWT_SECRET not set: accepting any token as the user id");
                Arc::new(AllowAnonymous)
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting Scribble sync server...");
    let server = SyncServer::new(args.server_config(), args.verifier())?;

    let runner = server.clone();
    let mut serving = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut serving => {
            // Listener failed before any shutdown request.
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, flushing boards");
            server.shutdown().await;
            serving.await??;
        }
    }

    let stats = server.stats().await;
    info!(
        "Served {} connections ({} rejected handshakes, {} backpressure drops)",
        stats.total_connections, stats.rejected_handshakes, stats.backpressure_drops
    );
    Ok(())
}
