//! ditto-admission: admission control in front of a stub relay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::any;
use axum::{Json, Router};
use clap::Parser;
use tracing::{info, warn};

use ditto_admission::dispatch::{MemoryAffinityStore, StaticChannelIndex};
use ditto_admission::http::{identity_from_headers, router};
use ditto_admission::limiter::{LimiterBackend, MemoryLimiter};
use ditto_admission::{AdmissionConfig, AdmissionState, Clock, Env, RoutingContext, SystemClock};

#[derive(Parser)]
#[command(name = "ditto-admission")]
#[command(about = "Admission control and dispatch for an LLM gateway")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "ADMISSION_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,
    /// Dotenv file whose entries override the process environment.
    #[arg(long)]
    dotenv: Option<PathBuf>,
    /// TOML config file; environment keys are applied on top.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// TOML file with the channel table.
    #[arg(long)]
    channels: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn load_env(path: Option<&Path>) -> Result<Env, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|err| format!("read dotenv {}: {err}", path.display()))?;
            Ok(Env::parse_dotenv(&raw))
        }
        None => Ok(Env::default()),
    }
}

fn load_channels(path: Option<&Path>) -> Result<StaticChannelIndex, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(StaticChannelIndex::default());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("read channels {}: {err}", path.display()))?;
    Ok(toml::from_str(&raw)?)
}

async fn build_backend(
    config: &AdmissionConfig,
    clock: Arc<dyn Clock>,
) -> Result<(LimiterBackend, Option<Arc<MemoryLimiter>>), Box<dyn std::error::Error>> {
    #[cfg(feature = "store-redis")]
    if let Some(url) = config.redis.url.as_deref() {
        let mut store =
            ditto_admission::limiter::RedisScriptStore::new(url, config.redis.max_in_flight)?;
        if !config.redis.key_prefix.is_empty() {
            store = store.with_prefix(config.redis.key_prefix.clone());
        }
        let runtime = ditto_admission::limiter::ScriptRuntime::new(
            Arc::new(store),
            config.rate_limit.store_op_timeout(),
        );
        if let Err(err) = runtime.preload().await {
            warn!(error = %err, "limiter scripts not preloaded; they load on first use");
        }
        return Ok((LimiterBackend::Shared(runtime), None));
    }
    #[cfg(not(feature = "store-redis"))]
    if config.redis.enabled() {
        warn!("redis configured but store-redis is disabled; using the in-process limiter");
    }

    let memory = Arc::new(MemoryLimiter::new(clock));
    Ok((LimiterBackend::Local(memory.clone()), Some(memory)))
}

async fn relay_stub(Extension(context): Extension<RoutingContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "model": context.model,
        "relay_mode": context.relay_mode,
        "channel": context.channel.map(|channel| channel.id),
        "group": context.group,
        "fingerprint_hit": context.fingerprint_hit,
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let env = load_env(args.dotenv.as_deref())?;
    let config = match args.config.as_deref() {
        Some(path) => AdmissionConfig::load_toml(path)?.with_env(&env),
        None => AdmissionConfig::from_env(&env),
    };
    config.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let index = load_channels(args.channels.as_deref())?;
    info!(channels = index.channels.len(), "channel table loaded");

    let (backend, memory) = build_backend(&config, clock.clone()).await?;
    let cleanup_interval = config.fingerprint.cleanup_interval();
    let state = AdmissionState::new(
        config,
        backend,
        Arc::new(index),
        Arc::new(MemoryAffinityStore::new()),
        clock,
    );

    let seeded = state.cache.prewarm();
    let _sweeper = state.cache.spawn_sweeper();
    let _janitor = memory.map(|memory| memory.spawn_janitor(cleanup_interval));
    info!(
        limiter = state.limiter.backend_name(),
        warm_entries = seeded,
        "admission state ready"
    );

    let relay = Router::new()
        .route("/v1/*path", any(relay_stub))
        .route("/v1beta/*path", any(relay_stub))
        .route("/pg/*path", any(relay_stub))
        .route("/mj/*path", any(relay_stub))
        .route("/suno/*path", any(relay_stub));
    let app = router(state, relay).layer(axum::middleware::from_fn(identity_from_headers));

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "ditto-admission listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
