use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use fleetbot_config::Config;
use fleetbot_contracts::{InboundUpdate, Region};
use fleetbot_kernel::parse_command;

pub mod audit;
pub mod authz;
pub mod cache;
pub mod cloud;
pub mod commands;
pub mod dedup;
pub mod dispatch;
pub mod instances;
pub mod messages;
pub mod messenger;
pub mod orchestrator;
pub mod store;
pub mod task_config;
pub mod waiter;

#[cfg(test)]
mod fakes;
#[cfg(test)]
mod test_http;

pub use audit::verify_audit_chain;

use audit::{AuditJsonl, AuditRecord};
use authz::{AuthorizationEngine, Authorizer};
use cloud::{ClientFactory, ClientPool, HttpComputeClient, InstanceApi, TaskApi};
use commands::{default_registry, CommandDeps};
use dedup::DedupRegistry;
use dispatch::{DispatchOutcome, Dispatcher, RequestContext};
use instances::{InstanceManager, InstanceSettings};
use messages::MessageCatalog;
use messenger::{Messenger, TelegramMessenger};
use orchestrator::{NodeOrchestrator, NodeSettings};
use store::{BlobStore, MemoryBlobStore, SqliteBlobStore};
use task_config::{BlobParameterSource, TaskConfigCache};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "webhook server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// The outbound edges of the bot: chat delivery and per-region compute
/// clients. Tests swap these for in-process fakes.
pub struct Collaborators {
    pub messenger: Arc<dyn Messenger>,
    pub tasks: ClientFactory<dyn TaskApi>,
    pub instances: ClientFactory<dyn InstanceApi>,
}

impl Collaborators {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.compute.timeout_ms))
            .build()
            .map_err(|e| format!("http client build failed: {e}"))?;

        let task_http = http.clone();
        let task_endpoint = cfg.compute.endpoint.clone();
        let task_token = cfg.compute.api_token.clone();
        let instance_http = http.clone();
        let instance_endpoint = cfg.compute.endpoint.clone();
        let instance_token = cfg.compute.api_token.clone();

        Ok(Self {
            messenger: Arc::new(TelegramMessenger::new(
                http,
                &cfg.bot.api_base_url,
                &cfg.bot.token,
            )),
            tasks: Arc::new(move |region: &str| -> Arc<dyn TaskApi> {
                Arc::new(HttpComputeClient::new(
                    task_http.clone(),
                    &task_endpoint,
                    task_token.clone(),
                    region,
                ))
            }),
            instances: Arc::new(move |region: &str| -> Arc<dyn InstanceApi> {
                Arc::new(HttpComputeClient::new(
                    instance_http.clone(),
                    &instance_endpoint,
                    instance_token.clone(),
                    region,
                ))
            }),
        })
    }
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let collaborators = Collaborators::from_config(&cfg)?;
    build_app_with(cfg, collaborators).await
}

pub async fn build_app_with(cfg: Config, collaborators: Collaborators) -> Result<Router, String> {
    let state = AppState::new(cfg, collaborators).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/webhook", post(webhook))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    webhook_secret: Option<String>,
    default_language: String,
    dedup: Arc<DedupRegistry>,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditJsonl>,
}

impl AppState {
    async fn new(cfg: Config, collaborators: Collaborators) -> Result<Self, String> {
        let store: Arc<dyn BlobStore> = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .as_deref()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Arc::new(SqliteBlobStore::new(sqlite_path).map_err(|e| e.to_string())?)
        } else {
            Arc::new(MemoryBlobStore::default())
        };

        let authz = Arc::new(AuthorizationEngine::new(
            cfg.authz.enabled,
            store.clone(),
            &cfg.authz.permissions_key,
        ));
        authz
            .bootstrap_admins(&cfg.authz.bootstrap_admins)
            .await
            .map_err(|e| format!("bootstrap admins failed: {e}"))?;

        let regions: Vec<Region> = cfg
            .regions
            .iter()
            .map(|r| Region {
                id: r.id.clone(),
                city: r.city.clone(),
                label: r.label.clone(),
            })
            .collect();
        let instance_regions = if cfg.instances.regions.is_empty() {
            regions.iter().map(|r| r.id.clone()).collect()
        } else {
            cfg.instances.regions.clone()
        };

        let task_config = Arc::new(TaskConfigCache::new(Arc::new(BlobParameterSource::new(
            store,
            &cfg.nodes.task_parameters_key,
        ))));
        let orchestrator = Arc::new(NodeOrchestrator::new(
            regions,
            Arc::new(ClientPool::new(collaborators.tasks)),
            task_config,
            NodeSettings {
                health_poll_interval: Duration::from_millis(cfg.nodes.health_poll_interval_ms),
                health_timeout: Duration::from_millis(cfg.nodes.health_timeout_ms),
                hostname_max_attempts: cfg.nodes.hostname_max_attempts,
            },
        ));
        let instances = Arc::new(InstanceManager::new(
            instance_regions,
            Arc::new(ClientPool::new(collaborators.instances)),
            InstanceSettings {
                poll_delay: Duration::from_millis(cfg.instances.poll_delay_ms),
                operation_timeout: Duration::from_millis(cfg.instances.operation_timeout_ms),
            },
        ));

        let catalog = MessageCatalog::load(
            &cfg.messages.default_language,
            cfg.messages.catalog_path.as_deref(),
        )?;
        let registry = default_registry(&CommandDeps {
            orchestrator,
            instances,
            authz: authz.clone(),
        });
        let dispatcher = Dispatcher::new(
            registry,
            authz as Arc<dyn Authorizer>,
            collaborators.messenger,
            Arc::new(catalog),
        );

        Ok(Self {
            webhook_secret: cfg.bot.webhook_secret.clone().filter(|s| !s.is_empty()),
            default_language: cfg.messages.default_language.clone(),
            dedup: Arc::new(DedupRegistry::new(
                cfg.dedup.root_path.clone(),
                Duration::from_secs(cfg.dedup.ttl_seconds),
            )),
            dispatcher: Arc::new(dispatcher),
            audit: Arc::new(
                AuditJsonl::new(
                    &cfg.audit.jsonl_path,
                    cfg.audit.immutable_mirror_path.as_deref(),
                )
                .await?,
            ),
        })
    }

    async fn process_update(&self, update: InboundUpdate) {
        let event_id = update.update_id.to_string();
        let Some(message) = update.message else {
            tracing::debug!(event_id = %event_id, "update without a message ignored");
            return;
        };
        let Some(chat_id) = message.chat.as_ref().map(|c| c.id) else {
            tracing::warn!(event_id = %event_id, "message without chat id ignored");
            return;
        };
        let text = message.text.as_deref().map(str::trim).unwrap_or_default();
        if text.is_empty() {
            tracing::warn!(event_id = %event_id, chat_id, "message without text ignored");
            return;
        }
        let sender = message.from.as_ref();
        let username = sender
            .and_then(|s| s.username.clone())
            .unwrap_or_default();
        let language_code = sender
            .and_then(|s| s.language_code.clone())
            .unwrap_or_else(|| self.default_language.clone());
        let command_name = parse_command(text).map(|p| p.name).unwrap_or_default();

        if !self.dedup.register_event(&event_id).await {
            tracing::info!(event_id = %event_id, chat_id, "duplicate update dropped");
            self.audit
                .append(AuditRecord::new(
                    &event_id,
                    chat_id,
                    &username,
                    &command_name,
                    "dropped",
                    "duplicate",
                ))
                .await;
            return;
        }

        let ctx = RequestContext {
            event_id: event_id.clone(),
            chat_id,
            username: username.clone(),
            language_code,
        };
        let outcome = self.run_isolated(&ctx, text, &command_name).await;
        tracing::info!(
            event_id = %event_id,
            username = %username,
            command = outcome.command(),
            result = outcome.result(),
            reason_code = outcome.reason_code(),
            "update handled"
        );
        self.audit
            .append(AuditRecord::new(
                &event_id,
                chat_id,
                &username,
                outcome.command(),
                outcome.result(),
                outcome.reason_code(),
            ))
            .await;
    }

    /// A panicking handler is contained to its own task and answered with the
    /// generic internal error.
    async fn run_isolated(
        &self,
        ctx: &RequestContext,
        text: &str,
        command_name: &str,
    ) -> DispatchOutcome {
        let dispatcher = self.dispatcher.clone();
        let task_ctx = ctx.clone();
        let text = text.to_string();
        match tokio::spawn(async move { dispatcher.dispatch(&task_ctx, &text).await }).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, event_id = %ctx.event_id, command = command_name, "command handler aborted");
                let reply = self.dispatcher.tr(ctx, "error.internal", &[]);
                self.dispatcher.send(ctx, &reply).await;
                DispatchOutcome::Internal {
                    command: command_name.to_string(),
                }
            }
        }
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Acknowledges every authenticated delivery with `200 ok` so the transport
/// does not redeliver; problems with the payload are only logged.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            tracing::warn!("webhook secret mismatch");
            return (StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }
    match serde_json::from_slice::<InboundUpdate>(&body) {
        Ok(update) => state.process_update(update).await,
        Err(err) => tracing::warn!(error = %err, "unparseable webhook body"),
    }
    (StatusCode::OK, "ok")
}
