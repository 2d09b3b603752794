use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::AgentEvent;

/// Minimum gap between two identical status messages.
const STATUS_COALESCE_WINDOW: Duration = Duration::from_millis(2_500);

/// Per-turn event sink. The loop owns it; the transport side consumes the
/// paired receiver.
///
/// Enforces the turn's event invariants at the source: `done` fires exactly
/// once, nothing is emitted after it, duplicate statuses are coalesced, and
/// statuses are dropped (not blocked on) when the buffer is full.
pub struct EventSink {
    tx: mpsc::Sender<AgentEvent>,
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    last_status: Option<(String, Instant)>,
    visible_emitted: bool,
    done_emitted: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            tx,
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Bounded channel pair for tests and embedded use.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Emit an advisory status hint. Coalesced and droppable.
    pub fn status(&self, message: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done_emitted {
                return;
            }
            if let Some((last, at)) = &state.last_status {
                if last == message && at.elapsed() < STATUS_COALESCE_WINDOW {
                    return;
                }
            }
            state.last_status = Some((message.to_string(), Instant::now()));
        }
        // Advisory: never block the loop on a slow client.
        if self
            .tx
            .try_send(AgentEvent::Status {
                message: message.to_string(),
            })
            .is_err()
        {
            debug!("status event dropped (buffer full or receiver gone)");
        }
    }

    /// Emit a non-terminal event, blocking on backpressure.
    pub async fn emit(&self, event: AgentEvent) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done_emitted {
                warn!(?event, "event suppressed after done");
                return;
            }
            if event.is_visible_output() {
                state.visible_emitted = true;
            }
        }
        if self.tx.send(event).await.is_err() {
            debug!("event dropped (receiver gone)");
        }
    }

    /// Emit the terminal event. Later calls are no-ops.
    pub async fn done(&self, event: AgentEvent) {
        debug_assert!(matches!(event, AgentEvent::Done { .. }));
        {
            let mut state = self.state.lock().unwrap();
            if state.done_emitted {
                warn!("duplicate done suppressed");
                return;
            }
            state.done_emitted = true;
        }
        if self.tx.send(event).await.is_err() {
            debug!("done event dropped (receiver gone)");
        }
    }

    /// Whether any `text`/`table`/`plot` event went out this turn.
    pub fn visible_emitted(&self) -> bool {
        self.state.lock().unwrap().visible_emitted
    }
}
