//! Per-session turn ownership: at most one active agent loop per session,
//! cooperative stop, and transport replacement on reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tabula_agent::runtime::{AgentLoop, TurnTrigger};
use tabula_agent::sink::EventSink;
use tabula_agent::tool::SessionHandle;

/// Cap on buffered outbound events per session.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StartTurnError {
    #[error("a turn is already in progress; wait for done or send stop")]
    TurnActive,
}

struct ActiveTurn {
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
}

/// Owns a session's mutable runtime state. Lives in the app state map and is
/// shared by every connection to the session.
pub struct SessionRuntime {
    session_id: String,
    turn: Mutex<Option<ActiveTurn>>,
    /// The currently attached client, as serialized event lines. A reconnect
    /// swaps this; events emitted during a gap are dropped, not replayed.
    client: Arc<RwLock<Option<mpsc::Sender<String>>>>,
}

impl SessionRuntime {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            turn: Mutex::new(None),
            client: Arc::new(RwLock::new(None)),
        }
    }

    /// Point future events at a (re)connected client.
    pub async fn attach_client(&self, tx: mpsc::Sender<String>) {
        *self.client.write().await = Some(tx);
        debug!(session = %self.session_id, "client attached");
    }

    pub async fn has_active_turn(&self) -> bool {
        let guard = self.turn.lock().await;
        guard
            .as_ref()
            .map(|turn| !turn.finished.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Start a turn, spawning the agent loop and its event pump. Fails if a
    /// turn is already running.
    pub async fn start_turn(
        &self,
        agent: AgentLoop,
        handle: SessionHandle,
        trigger: TurnTrigger,
    ) -> Result<(), StartTurnError> {
        let mut guard = self.turn.lock().await;
        if let Some(turn) = guard.as_ref() {
            if !turn.finished.load(Ordering::SeqCst) {
                return Err(StartTurnError::TurnActive);
            }
        }

        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        *guard = Some(ActiveTurn {
            cancel: cancel.clone(),
            finished: finished.clone(),
        });
        drop(guard);

        let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);

        // Pump: turn events → whatever client is attached right now.
        let client = self.client.clone();
        let session_id = self.session_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(_) => continue,
                };
                let target = { client.read().await.clone() };
                match target {
                    Some(tx) => {
                        if tx.send(line).await.is_err() {
                            debug!(session = %session_id, "client gone, event dropped");
                        }
                    }
                    None => {
                        debug!(session = %session_id, "no client attached, event dropped");
                    }
                }
            }
        });

        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let outcome = agent.run(&handle, trigger, &sink, &cancel).await;
            finished.store(true, Ordering::SeqCst);
            info!(session = %session_id, ?outcome, "turn finished");
            // Close the event channel so the pump drains and exits.
            drop(sink);
            let _ = pump.await;
        });

        Ok(())
    }

    /// Cooperative stop: sets the active turn's cancellation token. No-op
    /// when the session is idle.
    pub async fn stop(&self) {
        let guard = self.turn.lock().await;
        if let Some(turn) = guard.as_ref() {
            if !turn.finished.load(Ordering::SeqCst) {
                info!(session = %self.session_id, "stop requested");
                turn.cancel.cancel();
            }
        }
    }
}
