//! cmdgate server assembly: load config, build the pipeline, mount one
//! webhook route per loaded adapter plus the fixed management routes, serve
//! with graceful shutdown.

use crate::audit::{AuditSink, TracingAuditSink};
use crate::binder::UserBinder;
use crate::chain::SecurityChain;
use crate::config::GatewayConfig;
use crate::filter::ResponseFilter;
use crate::gateway::{CommandGateway, WebhookOutcome};
use crate::ratelimit::RateLimiter;
use crate::routes;
use crate::store::GatewayStore;
use anyhow::Result;
use axum::Extension;
use axum::body::Bytes;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use cg_channels::{
    ChannelAdapter, EnvironmentMode, InternalChatAdapter, MattermostAdapter, SlackGatewayAdapter,
};
use cg_exec::{CommandCatalog, CommandRunner};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct GatewayState {
    pub gateway: Arc<CommandGateway>,
    pub instance_name: String,
    pub environment_mode: EnvironmentMode,
    pub started_at: Instant,
    pub challenge_ttl_minutes: i64,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("instance_name", &self.instance_name)
            .field("environment_mode", &self.environment_mode)
            .field("started_at", &self.started_at)
            .field("challenge_ttl_minutes", &self.challenge_ttl_minutes)
            .finish_non_exhaustive()
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = GatewayConfig::load_with_path(config_path).await?;
    let adapters = load_adapters(&cfg)?;
    tracing::info!(
        instance = %cfg.general.instance_name,
        environment_mode = ?cfg.general.environment_mode,
        config_path = %path.display(),
        commands = cfg.commands.len(),
        channels = ?adapters.keys().collect::<Vec<_>>(),
        "config ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = GatewayConfig::load_with_path(config_path).await?;
    let data_dir = cfg.data_dir_path()?;
    let store = GatewayStore::open(&data_dir.join("gateway.db"))?;
    tracing::info!(
        instance = %cfg.general.instance_name,
        environment_mode = ?cfg.general.environment_mode,
        config_path = %path.display(),
        data_dir = %data_dir.display(),
        commands = cfg.commands.len(),
        executions_recorded = store.execution_count()?,
        active_bindings = store
            .list_bindings(None, Some(crate::store::BindingStatus::Active))?
            .len(),
        "status ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = GatewayConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.general.bind_addr;
    tracing::info!(
        instance = %cfg.general.instance_name,
        environment_mode = ?cfg.general.environment_mode,
        bind_addr = %addr,
        config_path = %cfg_path.display(),
        http_timeout_seconds = cfg.general.http_timeout_seconds,
        http_max_in_flight = cfg.general.http_max_in_flight,
        replay_window_seconds = cfg.security.replay_window_seconds,
        rate_user_ceiling = cfg.security.rate_user_ceiling,
        rate_channel_ceiling = cfg.security.rate_channel_ceiling,
        commands = cfg.commands.len(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let data_dir = cfg.data_dir_path()?;
    let store = Arc::new(GatewayStore::open(&data_dir.join("gateway.db"))?);
    let state = build_state(&cfg, store, started_at)?;
    tracing::info!(
        channel_count = state.gateway.adapters().len(),
        channels = ?state.gateway.adapters().keys().collect::<Vec<_>>(),
        "gateway assembled"
    );

    let mut app = routes::router().layer(Extension(state.clone()));
    for (name, adapter) in state.gateway.adapters() {
        let channel = name.clone();
        let gateway = state.gateway.clone();
        app = app.route(
            adapter.webhook_path(),
            post(move |headers: HeaderMap, body: Bytes| {
                let gateway = gateway.clone();
                let channel = channel.clone();
                async move {
                    let outcome = gateway.handle_webhook(&channel, &headers, &body).await;
                    webhook_response(outcome)
                }
            }),
        );
        tracing::info!(channel = %name, path = %adapter.webhook_path(), "webhook route mounted");
    }

    let app = app
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.general.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.general.http_timeout_seconds),
        ))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "cmdgate serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");
    shutdown.cancel();
    Ok(())
}

pub fn build_state(
    cfg: &GatewayConfig,
    store: Arc<GatewayStore>,
    started_at: Instant,
) -> Result<Arc<GatewayState>> {
    let adapters = load_adapters(cfg)?;
    if adapters.is_empty() {
        return Err(anyhow::anyhow!(
            "no channel adapters are enabled and available in this environment"
        ));
    }

    let binder = Arc::new(UserBinder::new(store.clone()));
    let audit = Arc::new(TracingAuditSink) as Arc<dyn AuditSink>;
    let limiter = Arc::new(RateLimiter::new(
        cfg.security.rate_user_ceiling,
        cfg.security.rate_channel_ceiling,
        Duration::from_secs(cfg.security.rate_window_seconds),
    ));
    let chain = SecurityChain::new(
        binder.clone(),
        limiter,
        audit.clone(),
        &cfg.security,
        cfg.roles.clone(),
    );
    let runner = CommandRunner::new(
        Duration::from_secs(cfg.execution.timeout_seconds),
        cfg.execution.env_allowlist.clone(),
    );
    let gateway = Arc::new(CommandGateway::new(
        adapters,
        CommandCatalog::new(cfg.commands.clone()),
        chain,
        runner,
        ResponseFilter::new(&cfg.filter),
        binder,
        store,
        audit,
        cfg.security.challenge_ttl_minutes,
    ));

    Ok(Arc::new(GatewayState {
        gateway,
        instance_name: cfg.general.instance_name.clone(),
        environment_mode: cfg.general.environment_mode,
        started_at,
        challenge_ttl_minutes: cfg.security.challenge_ttl_minutes,
    }))
}

/// Builds every enabled adapter, then drops the ones that cannot operate
/// under the configured environment mode (network-isolated deployments lose
/// adapters that need outbound internet).
fn load_adapters(cfg: &GatewayConfig) -> Result<HashMap<String, Arc<dyn ChannelAdapter>>> {
    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
    if cfg.channels.internal.enabled {
        adapters.push(Arc::new(InternalChatAdapter::new(
            cfg.channels.internal.webhook_path.clone(),
            cfg.channels.internal.max_classification,
        )));
    }
    if cfg.channels.slack.enabled {
        adapters.push(Arc::new(SlackGatewayAdapter::new(
            cfg.channels.slack.webhook_path.clone(),
            &cfg.channels.slack.signing_secret,
            &cfg.channels.slack.bot_token,
            cfg.channels.slack.max_classification,
        )?));
    }
    if cfg.channels.mattermost.enabled {
        adapters.push(Arc::new(MattermostAdapter::new(
            cfg.channels.mattermost.webhook_path.clone(),
            &cfg.channels.mattermost.outgoing_token,
            &cfg.channels.mattermost.reply_url,
            cfg.channels.mattermost.max_classification,
        )?));
    }

    let mode = cfg.general.environment_mode;
    let mut loaded = HashMap::new();
    for adapter in adapters {
        if !adapter.is_available(mode) {
            tracing::warn!(
                channel = %adapter.channel_name(),
                environment_mode = ?mode,
                "channel adapter dropped: unavailable in this environment"
            );
            continue;
        }
        loaded.insert(adapter.channel_name().to_string(), adapter);
    }
    Ok(loaded)
}

fn webhook_response(outcome: WebhookOutcome) -> Response {
    let body = serde_json::json!({
        "status": outcome.status,
        "envelope_id": outcome.envelope_id,
    });
    if outcome.unauthorized {
        return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
    }
    (StatusCode::OK, axum::Json(body)).into_response()
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
