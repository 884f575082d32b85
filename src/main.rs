//! mnemo — semantic memory engine.
//! Transcripts in, ranked recall out: chunk → embed → search,
//! with lexical fallback when no provider answers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mnemo::config::{Credentials, GenConfig};
use mnemo::embed::EmbedderStack;
use mnemo::{api, chunker, db, indexer, AppState, EmbedCache, SharedDB};

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Semantic memory engine for conversational agents")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3923", env = "MNEMO_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "mnemo.db", env = "MNEMO_DB")]
    db: String,

    /// Directory of transcript sources (.txt/.md/.jsonl) to index
    #[arg(short, long, env = "MNEMO_SOURCES")]
    sources: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mdb = db::IndexDB::open(&args.db).expect("failed to open database");
    let shared: SharedDB = Arc::new(mdb);

    let creds = Credentials::from_env();
    let stack = Arc::new(EmbedderStack::from_credentials(&creds));
    if stack.is_empty() {
        warn!(
            "no embedding provider credential found — set MNEMO_EMBED_URL (+MNEMO_EMBED_KEY), \
             OPENAI_API_KEY, or MNEMO_OLLAMA_URL; search runs lexical-only until then"
        );
    } else {
        info!(providers = ?stack.provider_names(), model = ?stack.default_model(), "embedding enabled");
    }

    let gen = GenConfig::from_credentials(&creds);
    let api_key = creds.get("MNEMO_API_KEY");
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let stop = Arc::new(AtomicBool::new(false));
    let state = AppState {
        db: shared.clone(),
        stack: stack.clone(),
        gen: gen.clone(),
        api_key,
        embed_cache: EmbedCache::new(mnemo::thresholds::QUERY_CACHE_CAP),
        sources_dir: args.sources.clone(),
        stop: stop.clone(),
        started_at: std::time::Instant::now(),
    };
    let app = api::router(state.clone());

    // background indexing — scan + embed every MNEMO_INDEX_MINS (default 15)
    let index_mins: u64 = std::env::var("MNEMO_INDEX_MINS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15);
    if index_mins > 0 {
        let bg_db = shared.clone();
        let bg_stack = stack.clone();
        let bg_stop = stop.clone();
        let bg_sources = args.sources.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(index_mins.saturating_mul(60));
            // wait a bit before first run so startup isn't slowed
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            loop {
                if bg_stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(ref dir) = bg_sources {
                    let db = bg_db.clone();
                    let dir = dir.clone();
                    let scan = tokio::task::spawn_blocking(move || chunker::scan_dir(&db, &dir))
                        .await;
                    match scan {
                        Ok(Ok(r)) if r.chunks_created > 0 => {
                            info!(created = r.chunks_created, "background scan")
                        }
                        Ok(Err(e)) => warn!(error = %e, "background scan failed"),
                        _ => {}
                    }
                }
                match indexer::embed_all(&bg_db, &bg_stack, &bg_stop).await {
                    Ok(r) if r.embedded > 0 || r.failed > 0 => {
                        info!(embedded = r.embedded, failed = r.failed, "background embed")
                    }
                    Err(e) => warn!(error = %e, "background embed failed"),
                    _ => {}
                }
                tokio::time::sleep(interval).await;
            }
        });
        info!(every_mins = index_mins, "background indexing enabled");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %args.db,
        sources = ?args.sources,
        auth = auth_status,
        enrichment = gen.is_some(),
        "mnemo starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stop))
        .await
        .expect("server error");
}

/// Wait for SIGINT/SIGTERM, then raise the stop flag so in-flight embed
/// runs stop issuing provider calls and settle their claims.
async fn shutdown_signal(stop: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    stop.store(true, Ordering::Relaxed);
    info!("shutting down");
}
