//! Live event fan-out to connected observers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel depth; slow observers lag rather than block publishers.
const DEFAULT_CAPACITY: usize = 256;

/// Event pushed to observers of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    RunStarted {
        project_id: String,
        run_id: i64,
        agents: Vec<String>,
    },
    AgentExited {
        project_id: String,
        run_id: i64,
        agent: String,
        exit_code: Option<i32>,
        expected: bool,
    },
    AgentRestarted {
        project_id: String,
        run_id: i64,
        agent: String,
        pid: Option<u32>,
    },
    Checkpoint {
        project_id: String,
        run_id: i64,
        agent: String,
        checkpoint_type: String,
        data: String,
    },
    RunEnded {
        project_id: String,
        run_id: i64,
        status: String,
        stop_reason: String,
    },
}

impl SwarmEvent {
    pub fn project_id(&self) -> &str {
        match self {
            Self::RunStarted { project_id, .. }
            | Self::AgentExited { project_id, .. }
            | Self::AgentRestarted { project_id, .. }
            | Self::Checkpoint { project_id, .. }
            | Self::RunEnded { project_id, .. } => project_id,
        }
    }
}

/// Broadcast bus shared by every supervisor component.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SwarmEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(SwarmEvent::RunEnded {
            project_id: "p1".to_string(),
            run_id: 7,
            status: "stopped".to_string(),
            stop_reason: "user".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.project_id(), "p1");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(SwarmEvent::RunStarted {
            project_id: "p1".to_string(),
            run_id: 1,
            agents: vec![],
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SwarmEvent::AgentExited {
            project_id: "p1".to_string(),
            run_id: 2,
            agent: "alpha".to_string(),
            exit_code: Some(1),
            expected: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_exited");
        assert_eq!(json["exit_code"], 1);
    }
}
