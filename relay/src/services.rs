//! Process-scoped service container.
//!
//! Everything is constructed once at startup from [`config::Settings`] and
//! passed down explicitly; there are no global singletons. Tests build
//! their own container over temp storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::admission::{AdmissionConfig, AdmissionLimiter};
use crate::archival::{ArchivalConfig, LruArchiver};
use crate::llm::{ArkClient, LlmClient, OllamaClient};
use crate::longtext::LongTextPipeline;
use crate::metrics::{AdmissionMetrics, MetricsSnapshot};
use crate::queue::{LlmQueue, QueueConfig};
use crate::repo::sqlite::{
    SqliteConversationRepo, SqliteDb, SqliteMessageRepo, SqlitePlanRepo, SqliteUserRepo,
};
use crate::repo::upload::{FsUploadStore, UploadStore};
use crate::repo::{ConversationRepo, MessageRepo, PlanRepo, RepoError, UserRepo};
use crate::session::{AgentSessionStore, InMemoryAgentSessionStore, MultiAgentWorkflow};
use crate::stream::handler::ChatStreamHandler;
use crate::stream::progress::{InMemoryProgressStore, StreamProgressStore};
use crate::tools::breaker::{BreakerPolicy, CircuitBreaker, CompositeBreaker};
use crate::tools::builtin::register_builtin_tools;
use crate::tools::protocol::AdapterRegistry;
use crate::tools::{ToolError, ToolExecutor, ToolRegistry};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("storage: {0}")]
    Storage(#[from] RepoError),
    #[error("tool registration: {0}")]
    Tools(#[from] ToolError),
}

/// All long-lived services of one gateway process.
pub struct Services {
    pub admission: Arc<AdmissionLimiter>,
    pub queue: Arc<LlmQueue>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub adapters: Arc<AdapterRegistry>,
    pub users: Arc<dyn UserRepo>,
    pub conversations: Arc<dyn ConversationRepo>,
    pub messages: Arc<dyn MessageRepo>,
    pub plans: Arc<dyn PlanRepo>,
    pub uploads: Arc<dyn UploadStore>,
    pub progress: Arc<dyn StreamProgressStore>,
    pub sessions: Arc<dyn AgentSessionStore>,
    pub handler: Arc<ChatStreamHandler>,
    pub workflow: Arc<MultiAgentWorkflow>,
    pub longtext: Arc<LongTextPipeline>,
    pub archiver: Arc<LruArchiver>,
    /// Total adaptive-writer mode switches across all streams.
    pub sse_mode_switches: Arc<std::sync::atomic::AtomicU64>,
    llms: HashMap<String, Arc<dyn LlmClient>>,
    started_at: Instant,
}

impl Services {
    /// Wires the whole graph from resolved settings.
    pub async fn build(settings: &config::Settings) -> Result<Self, BuildError> {
        let db = SqliteDb::new(&settings.db_path)?;
        let users: Arc<dyn UserRepo> = Arc::new(SqliteUserRepo::new(db.clone()));
        let conversations: Arc<dyn ConversationRepo> =
            Arc::new(SqliteConversationRepo::new(db.clone()));
        let messages: Arc<dyn MessageRepo> = Arc::new(SqliteMessageRepo::new(db.clone()));
        let plans: Arc<dyn PlanRepo> = Arc::new(SqlitePlanRepo::new(db));
        let uploads: Arc<dyn UploadStore> = Arc::new(FsUploadStore::new(&settings.upload_dir));
        let progress: Arc<dyn StreamProgressStore> = Arc::new(InMemoryProgressStore::default());
        let sessions: Arc<dyn AgentSessionStore> = Arc::new(InMemoryAgentSessionStore::new());

        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(
            &registry,
            Arc::clone(&plans),
            settings.tavily_api_key.clone(),
        )
        .await?;
        let breaker: Arc<dyn BreakerPolicy> = match settings.breaker_mode {
            config::BreakerMode::Composite => Arc::new(CompositeBreaker::new()),
            config::BreakerMode::Default => Arc::new(CircuitBreaker::new()),
        };
        let executor = Arc::new(ToolExecutor::new(Arc::clone(&registry), breaker));
        let adapters = Arc::new(AdapterRegistry::with_defaults());

        let admission = Arc::new(AdmissionLimiter::new(AdmissionConfig {
            max_connections: settings.max_sse_connections,
            max_per_user: settings.max_sse_connections_per_user,
            ..AdmissionConfig::default()
        }));
        let queue = LlmQueue::new(QueueConfig {
            max_concurrent: settings.llm_max_concurrent,
            max_rpm: settings.llm_max_rpm,
            timeout: settings.llm_timeout,
        });

        let mut llms: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();
        llms.insert(
            "local".to_string(),
            Arc::new(OllamaClient::new(
                settings.ollama_api_url.clone(),
                settings.ollama_model.clone(),
            )),
        );
        if let Some(api_key) = &settings.ark_api_key {
            llms.insert(
                "volcano".to_string(),
                Arc::new(ArkClient::new(
                    settings.ark_api_url.clone(),
                    api_key.clone(),
                    "doubao-pro-32k".to_string(),
                )),
            );
        }

        let handler = Arc::new(ChatStreamHandler::new(
            Arc::clone(&queue),
            Arc::clone(&executor),
            Arc::clone(&adapters),
            Arc::clone(&conversations),
            Arc::clone(&messages),
            Arc::clone(&progress),
        ));
        let workflow = Arc::new(MultiAgentWorkflow::new(
            Arc::clone(&queue),
            Arc::clone(&sessions),
            Arc::clone(&conversations),
            Arc::clone(&messages),
            Arc::clone(&progress),
        ));
        let longtext = Arc::new(LongTextPipeline::new(
            Arc::clone(&queue),
            Arc::clone(&conversations),
            Arc::clone(&messages),
            Arc::clone(&progress),
        ));
        let archiver = Arc::new(LruArchiver::new(
            ArchivalConfig::default(),
            Arc::clone(&conversations),
            Arc::clone(&messages),
        ));

        Ok(Self {
            admission,
            queue,
            registry,
            executor,
            adapters,
            users,
            conversations,
            messages,
            plans,
            uploads,
            progress,
            sessions,
            handler,
            workflow,
            longtext,
            archiver,
            sse_mode_switches: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            llms,
            started_at: Instant::now(),
        })
    }

    /// Client for a request's `modelType` (`local` or `volcano`).
    pub fn llm(&self, model_type: &str) -> Option<Arc<dyn LlmClient>> {
        self.llms.get(model_type).map(Arc::clone)
    }

    /// Swap in a client (tests, or deployments with bespoke providers).
    pub fn set_llm(&mut self, model_type: impl Into<String>, client: Arc<dyn LlmClient>) {
        self.llms.insert(model_type.into(), client);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            admission: AdmissionMetrics {
                active_streams: self.admission.active_count(),
                queued_waiters: self.admission.queued_count(),
            },
            llm_queue: self.queue.metrics(),
            tools: self.executor.metrics_snapshot(),
            sse_mode_switches: self
                .sse_mode_switches
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// Periodic background maintenance: LRU sweep plus TTL reaping of
    /// ephemeral stores.
    pub async fn run_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.archiver.sweep().await {
                        tracing::warn!("lru sweep failed: {}", e);
                    }
                    if let Err(e) = self.progress.clean_expired().await {
                        tracing::warn!("progress reap failed: {}", e);
                    }
                    if let Err(e) = self.sessions.clean_expired().await {
                        tracing::warn!("session reap failed: {}", e);
                    }
                    if let Err(e) = self.uploads.cleanup_expired(Duration::from_secs(24 * 3600)).await {
                        tracing::warn!("upload reap failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> config::Settings {
        config::Settings {
            db_path: dir.join("relay.db").to_string_lossy().into_owned(),
            upload_dir: dir.join("uploads").to_string_lossy().into_owned(),
            ..config::Settings::default()
        }
    }

    #[tokio::test]
    async fn builds_the_full_graph() {
        let dir = tempfile::tempdir().unwrap();
        let services = Services::build(&settings(dir.path())).await.unwrap();
        assert!(services.llm("local").is_some());
        assert!(services.llm("volcano").is_none(), "no ark key configured");

        // Built-in tools are registered; search is disabled without a key.
        let names = services.registry.names();
        assert!(names.contains(&"web_search".to_string()));
        assert!(names.contains(&"plan_create".to_string()));
        assert!(names.contains(&"get_time".to_string()));
        let schemas = services.registry.enabled_schemas();
        assert!(!schemas
            .iter()
            .any(|s| s["function"]["name"] == "web_search"));
    }

    #[tokio::test]
    async fn metrics_snapshot_reflects_admission_state() {
        let dir = tempfile::tempdir().unwrap();
        let services = Services::build(&settings(dir.path())).await.unwrap();
        let m = services.metrics();
        assert_eq!(m.admission.active_streams, 0);
        assert!(!m.tools.is_empty());
    }
}
