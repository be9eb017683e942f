//! Per-participant media resources.
//!
//! A `ResourceGraph` holds one participant's transports, producers and
//! consumers as three flat maps. Producers and consumers always reference a
//! transport of the same graph. Teardown closes consumers, then producers,
//! then transports, so no engine handle is closed before its dependents.

use crate::engine::{MediaEngineGateway, MediaKind};
use crate::errors::{ResourceKind, SfuError};

use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEntry {
    pub id: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerEntry {
    pub id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEntry {
    pub id: String,
    pub transport_id: String,
    pub producer_id: String,
    /// Participant publishing the consumed producer.
    pub producer_owner: String,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Default)]
pub struct ResourceGraph {
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl ResourceGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transport(&mut self, transport_id: String) {
        self.transports.insert(
            transport_id.clone(),
            TransportEntry {
                id: transport_id,
                connected: false,
            },
        );
    }

    /// Register a producer on one of this graph's transports.
    ///
    /// # Errors
    ///
    /// `NotFound(Transport)` if the transport is not in the graph.
    pub fn insert_producer(&mut self, entry: ProducerEntry) -> Result<(), SfuError> {
        if !self.transports.contains_key(&entry.transport_id) {
            return Err(SfuError::NotFound(ResourceKind::Transport));
        }
        self.producers.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Register a consumer on one of this graph's transports.
    ///
    /// # Errors
    ///
    /// `NotFound(Transport)` if the transport is not in the graph.
    pub fn insert_consumer(&mut self, entry: ConsumerEntry) -> Result<(), SfuError> {
        if !self.transports.contains_key(&entry.transport_id) {
            return Err(SfuError::NotFound(ResourceKind::Transport));
        }
        self.consumers.insert(entry.id.clone(), entry);
        Ok(())
    }

    #[must_use]
    pub fn transport(&self, transport_id: &str) -> Option<&TransportEntry> {
        self.transports.get(transport_id)
    }

    pub fn transport_mut(&mut self, transport_id: &str) -> Option<&mut TransportEntry> {
        self.transports.get_mut(transport_id)
    }

    #[must_use]
    pub fn producer(&self, producer_id: &str) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub fn producer_mut(&mut self, producer_id: &str) -> Option<&mut ProducerEntry> {
        self.producers.get_mut(producer_id)
    }

    pub fn consumer_mut(&mut self, consumer_id: &str) -> Option<&mut ConsumerEntry> {
        self.consumers.get_mut(consumer_id)
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerEntry> {
        self.producers.remove(producer_id)
    }

    /// Drop every consumer of `producer_id`. The engine closes them along
    /// with the producer, so no close call is issued.
    pub fn drop_consumers_of(&mut self, producer_id: &str) -> usize {
        let before = self.consumers.len();
        self.consumers.retain(|_, c| c.producer_id != producer_id);
        before - self.consumers.len()
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerEntry> {
        self.producers.values()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    /// Close every resource in dependency order. Engine failures are logged
    /// and teardown continues.
    pub async fn teardown(self, gateway: &MediaEngineGateway, participant_id: &str) {
        for consumer_id in self.consumers.keys() {
            if let Err(e) = gateway.close_consumer(consumer_id).await {
                warn!(
                    target: "sfu.actor.room",
                    participant_id = %participant_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Failed to close consumer during teardown"
                );
            }
        }
        for producer_id in self.producers.keys() {
            if let Err(e) = gateway.close_producer(producer_id).await {
                warn!(
                    target: "sfu.actor.room",
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to close producer during teardown"
                );
            }
        }
        for transport_id in self.transports.keys() {
            if let Err(e) = gateway.close_transport(transport_id).await {
                warn!(
                    target: "sfu.actor.room",
                    participant_id = %participant_id,
                    transport_id = %transport_id,
                    error = %e,
                    "Failed to close transport during teardown"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{EngineOp, LoopbackEngine};
    use std::sync::Arc;

    fn producer(id: &str, transport_id: &str) -> ProducerEntry {
        ProducerEntry {
            id: id.to_string(),
            transport_id: transport_id.to_string(),
            kind: MediaKind::Audio,
            paused: false,
        }
    }

    fn consumer(id: &str, transport_id: &str, producer_id: &str) -> ConsumerEntry {
        ConsumerEntry {
            id: id.to_string(),
            transport_id: transport_id.to_string(),
            producer_id: producer_id.to_string(),
            producer_owner: "other".to_string(),
            kind: MediaKind::Audio,
            paused: true,
        }
    }

    #[test]
    fn test_resources_require_local_transport() {
        let mut graph = ResourceGraph::new();
        assert_eq!(
            graph.insert_producer(producer("p1", "t1")),
            Err(SfuError::NotFound(ResourceKind::Transport))
        );

        graph.insert_transport("t1".to_string());
        graph.insert_producer(producer("p1", "t1")).unwrap();
        graph.insert_consumer(consumer("c1", "t1", "remote")).unwrap();

        assert_eq!(graph.transport_count(), 1);
        assert_eq!(graph.producer_count(), 1);
        assert_eq!(graph.consumer_count(), 1);
    }

    #[test]
    fn test_drop_consumers_of_producer() {
        let mut graph = ResourceGraph::new();
        graph.insert_transport("t1".to_string());
        graph.insert_consumer(consumer("c1", "t1", "x")).unwrap();
        graph.insert_consumer(consumer("c2", "t1", "x")).unwrap();
        graph.insert_consumer(consumer("c3", "t1", "y")).unwrap();

        assert_eq!(graph.drop_consumers_of("x"), 2);
        assert_eq!(graph.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_closes_every_resource_once() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = MediaEngineGateway::new(engine.clone());

        let mut graph = ResourceGraph::new();
        graph.insert_transport("t1".to_string());
        graph.insert_transport("t2".to_string());
        graph.insert_producer(producer("p1", "t1")).unwrap();
        graph.insert_consumer(consumer("c1", "t2", "remote")).unwrap();

        graph.teardown(&gateway, "alice").await;

        assert_eq!(engine.call_count(EngineOp::CloseConsumer), 1);
        assert_eq!(engine.call_count(EngineOp::CloseProducer), 1);
        assert_eq!(engine.call_count(EngineOp::CloseTransport), 2);
        assert_eq!(engine.close_count("t1"), 1);
        assert_eq!(engine.close_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_teardown_continues_after_engine_error() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.fail_next(
            EngineOp::CloseProducer,
            crate::errors::EngineError::Unavailable,
        );
        let gateway = MediaEngineGateway::new(engine.clone());

        let mut graph = ResourceGraph::new();
        graph.insert_transport("t1".to_string());
        graph.insert_producer(producer("p1", "t1")).unwrap();

        graph.teardown(&gateway, "alice").await;

        assert_eq!(engine.call_count(EngineOp::CloseTransport), 1);
    }
}
