use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use tabula_agent::provider::LlmProvider;
use tabula_agent::runtime::AgentLoop;
use tabula_agent::tool::SessionHandle;
use tabula_core::Config;
use tabula_engine::QueryEngine;
use tabula_session::{SessionMeta, SessionStore};

use crate::runtime::SessionRuntime;

pub struct AppState {
    pub config: Config,
    /// Shared message store; writes are serialized per session by routing
    /// them through the session runtime.
    pub store: Arc<RwLock<SessionStore>>,
    pub engine: QueryEngine,
    /// None when no API key is configured — chat turns are rejected then.
    pub provider: Option<Arc<dyn LlmProvider>>,
    runtimes: RwLock<HashMap<String, Arc<SessionRuntime>>>,
}

impl AppState {
    pub fn new(config: Config, provider: Option<Arc<dyn LlmProvider>>) -> anyhow::Result<Self> {
        let store = SessionStore::new(&config.storage.data_dir)?;
        let engine = QueryEngine::new(Duration::from_secs(config.limits.sql_timeout_seconds));
        Ok(Self {
            config,
            store: Arc::new(RwLock::new(store)),
            engine,
            provider,
            runtimes: RwLock::new(HashMap::new()),
        })
    }

    /// Get or create the runtime owning a session's turn state.
    pub async fn runtime(&self, session_id: &str) -> Arc<SessionRuntime> {
        {
            let runtimes = self.runtimes.read().await;
            if let Some(runtime) = runtimes.get(session_id) {
                return runtime.clone();
            }
        }
        let mut runtimes = self.runtimes.write().await;
        runtimes
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionRuntime::new(session_id)))
            .clone()
    }

    /// Drop a session's runtime (after delete).
    pub async fn drop_runtime(&self, session_id: &str) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.remove(session_id) {
            runtime.stop().await;
        }
    }

    /// Build the per-turn session handle from persisted metadata.
    pub fn handle_for(&self, meta: &SessionMeta) -> SessionHandle {
        SessionHandle {
            session_id: meta.id.clone(),
            file_path: meta.file.path.clone(),
            filename: meta.file.filename.clone(),
            profile: meta.file.profile.clone(),
            store: self.store.clone(),
            engine: self.engine.clone(),
        }
    }

    /// Assemble the agent loop for one turn.
    pub fn agent_loop(&self, provider: Arc<dyn LlmProvider>) -> AgentLoop {
        AgentLoop::new(provider, self.config.limits.clone())
            .with_sampling(self.config.llm.temperature, self.config.llm.max_tokens)
    }
}
