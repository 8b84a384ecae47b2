//! Communication channels for the orchestrator service loop

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::{EngineError, Result};
use crate::orchestrator::{Request, RequestOutcome};

/// Orchestrator side of the channel
pub struct ChannelPair {
    /// Incoming requests
    pub request_rx: mpsc::UnboundedReceiver<Request>,
    /// Outgoing outcomes
    pub outcome_tx: mpsc::UnboundedSender<RequestOutcome>,
}

/// Client side of the channel
#[derive(Clone)]
pub struct OrchestratorChannel {
    request_tx: mpsc::UnboundedSender<Request>,
    outcome_rx: Arc<Mutex<mpsc::UnboundedReceiver<RequestOutcome>>>,
}

impl OrchestratorChannel {
    /// Returns the client channel and the orchestrator channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let channel = Self {
            request_tx,
            outcome_rx: Arc::new(Mutex::new(outcome_rx)),
        };
        let pair = ChannelPair {
            request_rx,
            outcome_tx,
        };

        (channel, pair)
    }

    /// Queue a request; returns its id
    pub fn submit(&self, request: Request) -> Result<String> {
        let id = request.id.clone();
        self.request_tx
            .send(request)
            .map_err(|_| EngineError::Channel("orchestrator is not running".into()))?;
        Ok(id)
    }

    /// Non-blocking receive; `None` when nothing is ready or another
    /// receiver holds the queue
    pub fn try_recv(&self) -> Option<RequestOutcome> {
        self.outcome_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the next outcome; `None` once the service loop has stopped
    pub async fn recv(&self) -> Option<RequestOutcome> {
        self.outcome_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }
}
