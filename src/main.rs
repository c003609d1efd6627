use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gostwriter::api::{self, AppState};
use gostwriter::config;
use gostwriter::jobs::{JobStore, Queue, SqliteJobStore};
use gostwriter::llm::{AiProxyClient, LlmClient, MockClient};
use gostwriter::logging;
use gostwriter::processor::{CallbackPolicy, TranscriptionProcessor};
use gostwriter::storage::Uploader;
use gostwriter::targets::{GitTarget, GithubTarget, Registry};

const REPOS_DIR_NAME: &str = "repos";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Provisional level until the configured one is known.
    let filter_handle = logging::init();

    dotenvy::dotenv().ok();

    let config_path = std::env::args().nth(1).unwrap_or_default();
    let cfg = config::load(&config_path)?;
    if let Err(e) = logging::apply_level(&filter_handle, &cfg.server.log_level) {
        warn!(error = %e, "keeping provisional log level");
    }

    let store = Arc::new(SqliteJobStore::open(&cfg.server.database_path).await?);
    let uploader = Arc::new(Uploader::new(&cfg.server.storage_dir));

    let mut registry = Registry::new();
    let repos_root = Path::new(&cfg.server.storage_dir).join(REPOS_DIR_NAME);
    match cfg.target.target_type.as_str() {
        "github" => {
            registry.add(Arc::new(GithubTarget::new(
                cfg.target.name.clone(),
                cfg.target.github.clone(),
            )?));
        }
        "git" => {
            registry.add(Arc::new(GitTarget::new(
                cfg.target.name.clone(),
                cfg.target.git.clone(),
                repos_root,
            )?));
        }
        other => anyhow::bail!("unsupported target type {other:?}"),
    }
    let registry = Arc::new(registry);
    info!(name = %cfg.target.name, target_type = %cfg.target.target_type, "target registered");

    let llm: Arc<dyn LlmClient> = match cfg.llm.provider.as_str() {
        "mock" => Arc::new(MockClient::new(cfg.llm.mock.clone())),
        "aiproxy" => Arc::new(AiProxyClient::new(cfg.llm.aiproxy.clone())),
        other => anyhow::bail!("unsupported llm provider {other:?}"),
    };

    let processor = Arc::new(TranscriptionProcessor::new(
        store.clone(),
        llm,
        registry,
        CallbackPolicy {
            retries: cfg.server.effective_callback_retries(),
            backoff: cfg.server.callback_backoff.as_duration(),
        },
    ));

    let queue = Arc::new(Queue::new(
        config::DEFAULT_QUEUE_CAPACITY,
        cfg.server.effective_worker_count(),
    ));
    queue.start(processor.clone())?;

    let state = AppState {
        store: store.clone(),
        queue: queue.clone(),
        uploader,
        processor,
        target_name: cfg.target.name.clone(),
        api_key: cfg.server.api_key.clone(),
        max_upload_size: cfg.server.max_upload_size.as_u64(),
    };
    let router = api::build_router(state, cfg.server.write_timeout.as_duration());

    // Serve until a signal arrives or the listener fails.
    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    if let Err(e) = api::server::serve(&cfg.server.address, router, shutdown.clone()).await {
        error!(error = %e, "server error");
        shutdown.cancel();
    }

    // Drain workers, then release the store.
    queue.shutdown(cfg.server.shutdown_grace.as_duration()).await;
    store.close().await;
    info!("server stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
