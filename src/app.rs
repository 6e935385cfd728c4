use crate::{
    backend::{realtime::RealtimeBackend, AiBackend},
    call::CallManager,
    callrecord::{summary::OpenAiSummarizer, CallRecordManagerBuilder, Summarizer},
    config::Config,
    dialer::{DialScheduler, Dialer, HttpDialer, SqliteDialStore},
    handler::middleware::request_log::log_requests,
    slots::{create_slot_store, SlotSemaphore},
};
use anyhow::Result;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub calls: CallManager,
    pub slots: Arc<SlotSemaphore>,
    pub dialer: Option<Arc<DialScheduler>>,
    pub prometheus: Option<PrometheusHandle>,
}

pub type AppState = Arc<AppStateInner>;

#[derive(Default)]
pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub token: Option<CancellationToken>,
    backend: Option<Arc<dyn AiBackend>>,
    dialer: Option<Arc<dyn Dialer>>,
    prometheus: Option<PrometheusHandle>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn AiBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Wire the call manager, slot semaphore, dialer and call record
    /// pipeline. Background loops start here and stop with the token.
    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.token.unwrap_or_default();

        let backend: Arc<dyn AiBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(RealtimeBackend::new(config.backend.clone())),
        };

        let summarizer: Option<Arc<dyn Summarizer>> = match &config.summary {
            Some(summary) => match OpenAiSummarizer::new(summary) {
                Ok(summarizer) => Some(Arc::new(summarizer)),
                Err(e) => {
                    warn!("call summaries disabled: {}", e);
                    None
                }
            },
            None => None,
        };
        let mut callrecord = CallRecordManagerBuilder::new()
            .with_cancel_token(token.child_token())
            .with_config(config.callrecord.clone())
            .with_summarizer(summarizer)
            .build();
        let calls = CallManager::new(config.clone(), backend)
            .with_callrecord_sender(callrecord.sender.clone());
        tokio::spawn(async move {
            callrecord.serve().await;
        });

        let slots = Arc::new(SlotSemaphore::new(
            create_slot_store(&config.slots.store)?,
            config.slots.clone(),
        ));
        tokio::spawn(slots.clone().serve_reaper(token.child_token()));

        let dialer = if config.dialer.enabled {
            let vendor: Option<Arc<dyn Dialer>> = match self.dialer {
                Some(dialer) => Some(dialer),
                None => HttpDialer::from_config(&config.dialer)
                    .map(|dialer| Arc::new(dialer) as Arc<dyn Dialer>),
            };
            match vendor {
                Some(vendor) => {
                    let scheduler = Arc::new(DialScheduler::new(
                        config.worker_id(),
                        config.dialer.clone(),
                        Arc::new(SqliteDialStore::open(&config.dialer.database)?),
                        slots.clone(),
                        calls.clone(),
                        vendor,
                    ));
                    tokio::spawn(scheduler.clone().serve(token.child_token()));
                    Some(scheduler)
                }
                None => {
                    warn!("dialer enabled without a dial_url, outbound runs disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Arc::new(AppStateInner {
            config,
            token,
            calls,
            slots,
            dialer,
            prometheus: self.prometheus,
        }))
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!("listening on {}", addr);

    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            if let Err(e) = http_result {
                tracing::error!("Server error: {}", e);
                return Err(anyhow::anyhow!("Server error: {}", e));
            }
            info!("Server shut down gracefully");
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    shutdown(&state).await;
    Ok(())
}

/// Tear down live calls through their own hang-up path, then stop the
/// background loops.
pub async fn shutdown(state: &AppState) {
    state.calls.shutdown(SHUTDOWN_GRACE).await;
    state.token.cancel();
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    let skip_paths = Arc::new(vec![
        "/health".to_string(),
        state.config.metrics.path.clone(),
        "/telephony/stream".to_string(),
    ]);
    crate::handler::router(&state.config.metrics.path)
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(skip_paths, log_requests))
        .layer(cors)
}

/// Install the global metrics recorder, once per process.
pub fn install_prometheus(config: &Config) -> Option<PrometheusHandle> {
    if !config.metrics.enabled {
        return None;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("metrics exporter not installed: {}", e);
            None
        }
    }
}
