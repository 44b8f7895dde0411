//! veil-node — the Veil backend server binary.
//!
//! Startup sequence:
//!   1. Open (or initialise) the store
//!   2. Load the pricing table
//!   3. Assemble the core: hubs, roster, epoch manager, reservations,
//!      streaming pipeline, sessions
//!   4. Start the JSON-RPC 2.0 server (HTTP + WS)
//!   5. Run until interrupted

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use veil_billing::{MemoryReservationStore, PricingTable, RateLimiter, ReservationStore};
use veil_broadcast::HubRegistry;
use veil_core::constants::{
    DEFAULT_LLM_STREAM_TIMEOUT_SECS, GUEST_ACCESS_LIMIT_PER_MINUTE, GUEST_RATE_WINDOW_SECS,
    GUEST_SEND_LIMIT_PER_MINUTE, STREAM_BATCH_INTERVAL_MS,
};
use veil_core::types::{credits_from_dollars, Credits};
use veil_core::{Clock, SystemClock};
use veil_epoch::EpochManager;
use veil_roster::RosterService;
use veil_rpc::{RpcServer, RpcServerState, SessionRegistry};
use veil_store::{KeyedLocks, StoreDb};
use veil_stream::{HttpLlmStreamer, StreamConfig, StreamPipeline};

#[derive(Parser, Debug)]
#[command(
    name = "veil-node",
    version,
    about = "Veil — E2EE group chat core with an LLM proxy"
)]
struct Args {
    /// Directory for the persistent store.
    #[arg(long, env = "VEIL_DATA_DIR", default_value = "~/.veil/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address (HTTP + WS).
    #[arg(long, env = "VEIL_RPC_ADDR", default_value = "127.0.0.1:8640")]
    rpc_addr: SocketAddr,

    /// LLM provider base URL (OpenAI-compatible).
    #[arg(long, env = "VEIL_LLM_BASE_URL", default_value = "https://api.openai.com")]
    llm_base_url: String,

    /// LLM provider API key.
    #[arg(long, env = "VEIL_LLM_API_KEY", default_value = "", hide_env_values = true)]
    llm_api_key: String,

    /// Provider label recorded on completion rows.
    #[arg(long, env = "VEIL_LLM_PROVIDER", default_value = "openai")]
    llm_provider: String,

    /// Shared secret the payment processor signs webhooks with.
    #[arg(long, env = "VEIL_WEBHOOK_SECRET", default_value = "", hide_env_values = true)]
    webhook_secret: String,

    /// Daily free-tier allowance (dollars).
    #[arg(long, env = "VEIL_FREE_ALLOWANCE", default_value = "0.25")]
    free_allowance: String,

    /// One-time signup credit (dollars).
    #[arg(long, env = "VEIL_WELCOME_CREDIT", default_value = "1.00")]
    welcome_credit: String,

    /// Floor for owner-covered group spend (negative dollars).
    #[arg(long, env = "VEIL_NEGATIVE_FLOOR", default_value = "-5.00", allow_hyphen_values = true)]
    negative_floor: String,

    /// Per-model pricing table JSON; built-in defaults when omitted.
    #[arg(long, env = "VEIL_PRICING_TABLE")]
    pricing_table: Option<PathBuf>,

    /// Provider fee override (percent on top of raw model pricing).
    #[arg(long, env = "VEIL_PROVIDER_FEE_PERCENT")]
    provider_fee_percent: Option<u32>,

    /// Guest sends per IP per minute.
    #[arg(long, env = "VEIL_GUEST_SEND_LIMIT", default_value_t = GUEST_SEND_LIMIT_PER_MINUTE)]
    guest_send_limit: u32,

    /// Guest conversation fetches per IP per minute.
    #[arg(long, env = "VEIL_GUEST_ACCESS_LIMIT", default_value_t = GUEST_ACCESS_LIMIT_PER_MINUTE)]
    guest_access_limit: u32,

    /// Estimate billing from character counts when the provider reports no
    /// usage (dev/test).
    #[arg(long, env = "VEIL_DEV_BILLING", default_value_t = false)]
    dev_billing: bool,

    /// Per-read timeout on the LLM token stream (seconds).
    #[arg(long, env = "VEIL_STREAM_TIMEOUT_SECS", default_value_t = DEFAULT_LLM_STREAM_TIMEOUT_SECS)]
    stream_timeout_secs: u64,
}

fn parse_dollars(s: &str, what: &str) -> anyhow::Result<Credits> {
    credits_from_dollars(s).with_context(|| format!("invalid {what}: {s:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,veil=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("Veil node starting");

    // ── Store ─────────────────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db = Arc::new(StoreDb::open(&data_dir).context("opening store")?);

    // ── Pricing ───────────────────────────────────────────────────────────────
    let mut pricing = match &args.pricing_table {
        Some(path) => PricingTable::load_json(path)
            .map_err(|e| anyhow::anyhow!("loading pricing table: {e}"))?,
        None => PricingTable::builtin(),
    };
    if let Some(fee) = args.provider_fee_percent {
        pricing.provider_fee_percent = fee;
    }

    let free_allowance = parse_dollars(&args.free_allowance, "free allowance")?;
    let welcome_credit = parse_dollars(&args.welcome_credit, "welcome credit")?;
    let negative_floor = parse_dollars(&args.negative_floor, "negative floor")?;
    anyhow::ensure!(negative_floor <= 0, "negative floor must not be positive");

    // ── Core assembly ─────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hubs = Arc::new(HubRegistry::new());
    let conversation_locks = Arc::new(KeyedLocks::new());
    let wallet_locks = Arc::new(KeyedLocks::new());
    let reservations: Arc<dyn ReservationStore> = Arc::new(MemoryReservationStore::new());

    let roster = Arc::new(RosterService::new(
        Arc::clone(&db),
        Arc::clone(&hubs),
        Arc::clone(&clock),
    ));
    let epochs = Arc::new(EpochManager::new(
        Arc::clone(&db),
        Arc::clone(&hubs),
        Arc::clone(&conversation_locks),
        Arc::clone(&clock),
    ));
    let streamer = Arc::new(HttpLlmStreamer::new(
        args.llm_base_url.clone(),
        args.llm_api_key.clone(),
        args.llm_provider.clone(),
    ));
    let pipeline = Arc::new(StreamPipeline::new(
        Arc::clone(&db),
        Arc::clone(&hubs),
        Arc::clone(&roster),
        streamer,
        Arc::clone(&reservations),
        Arc::new(pricing),
        Arc::clone(&wallet_locks),
        Arc::clone(&clock),
        StreamConfig {
            free_allowance,
            negative_floor,
            dev_billing: args.dev_billing,
            token_batch_interval: Duration::from_millis(STREAM_BATCH_INTERVAL_MS),
            stream_timeout: Duration::from_secs(args.stream_timeout_secs),
            provider: args.llm_provider.clone(),
        },
    ));

    // ── RPC server ────────────────────────────────────────────────────────────
    let state = Arc::new(RpcServerState {
        db,
        pipeline,
        roster,
        epochs,
        hubs,
        sessions: Arc::new(SessionRegistry::new()),
        clock,
        webhook_secret: args.webhook_secret.clone(),
        welcome_credit,
        free_allowance,
        guest_access_limiter: RateLimiter::new(args.guest_access_limit, GUEST_RATE_WINDOW_SECS),
        guest_send_limiter: RateLimiter::new(args.guest_send_limit, GUEST_RATE_WINDOW_SECS),
    });
    let handle = RpcServer::new(state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!(addr = %args.rpc_addr, "Veil node running");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    let _ = handle.stop();
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
