use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// Events that can be emitted by components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // API events
    APICallStarted {
        provider: String,
        model: String,
        attempt: u32,
    },
    APICallCompleted {
        provider: String,
        tokens: usize,
    },
    APIError {
        provider: String,
        error: String,
    },
    RetryScheduled {
        provider: String,
        attempt: u32,
        delay_ms: u64,
    },

    // Interpretation events
    PlanInterpreted {
        tasks: usize,
        warnings: usize,
    },
    InterpretationFailed {
        reason: String,
    },
}

/// Event bus for component communication
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    metrics: Arc<RwLock<Metrics>>,
}

/// Accumulated metrics from events
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub total_api_calls: usize,
    pub total_tokens: usize,
    pub api_errors: usize,
    pub retries: usize,
    pub plans_interpreted: usize,
    pub interpretation_failures: usize,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: Arc::new(RwLock::new(Metrics::default())),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub async fn emit(&self, event: Event) -> Result<()> {
        self.update_metrics(&event).await;

        // No receivers is fine
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Get current metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.read().await.clone()
    }

    async fn update_metrics(&self, event: &Event) {
        let mut metrics = self.metrics.write().await;

        match event {
            Event::APICallCompleted { tokens, .. } => {
                metrics.total_api_calls += 1;
                metrics.total_tokens += tokens;
            }
            Event::APIError { .. } => {
                metrics.api_errors += 1;
            }
            Event::RetryScheduled { .. } => {
                metrics.retries += 1;
            }
            Event::PlanInterpreted { .. } => {
                metrics.plans_interpreted += 1;
            }
            Event::InterpretationFailed { .. } => {
                metrics.interpretation_failures += 1;
            }
            Event::APICallStarted { .. } => {}
        }
    }
}
