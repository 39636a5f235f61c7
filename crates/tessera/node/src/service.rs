//! Single-task async service around a [`WitnessNode`]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tessera_committee::Committee;
use tessera_consensus::WitnessMessage;
use tessera_primitives::{Block, Transaction, WitnessId};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{CoinStore, NodeError, NodeEvent, TimerFired, TimerManager, WitnessNode};

const SERVICE_CHANNEL_SIZE: usize = 1024;
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Inputs of the node service
#[derive(Debug)]
pub enum ServiceMessage {
    /// Consensus message from a connected peer
    Peer {
        /// Peer that delivered it
        sender: WitnessId,
        /// The message
        message: WitnessMessage,
    },
    /// A consensus timer expired
    Timeout(TimerFired),
    /// Queue a transaction
    Transaction(Transaction),
    /// Block committed by another witness group
    ImportBlock(Block),
    /// Start consensus for a committee
    JoinCommittee(Committee),
    /// Stop the service
    Shutdown,
}

impl From<TimerFired> for ServiceMessage {
    fn from(fired: TimerFired) -> Self {
        Self::Timeout(fired)
    }
}

/// Handle to a running node service
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: WitnessId,
    tx: mpsc::Sender<ServiceMessage>,
    events: broadcast::Sender<NodeEvent>,
    running: Arc<AtomicBool>,
}

impl NodeHandle {
    /// Witness the service runs for
    pub const fn id(&self) -> WitnessId {
        self.id
    }

    /// Check if the service loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Subscribe to node events: broadcasts, commits, finality, bans
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Deliver a consensus message received from `sender`
    pub async fn deliver(&self, sender: WitnessId, message: WitnessMessage) -> Result<(), NodeError> {
        self.send(ServiceMessage::Peer { sender, message }).await
    }

    /// Queue a transaction
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), NodeError> {
        self.send(ServiceMessage::Transaction(tx)).await
    }

    /// Import a block committed by another group
    pub async fn import_block(&self, block: Block) -> Result<(), NodeError> {
        self.send(ServiceMessage::ImportBlock(block)).await
    }

    /// Start consensus for a committee
    pub async fn join_committee(&self, committee: Committee) -> Result<(), NodeError> {
        self.send(ServiceMessage::JoinCommittee(committee)).await
    }

    /// Shutdown the service
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.send(ServiceMessage::Shutdown).await
    }

    async fn send(&self, message: ServiceMessage) -> Result<(), NodeError> {
        self.tx.send(message).await.map_err(|_| NodeError::ServiceStopped)
    }
}

/// Owns the node; handles every input in arrival order
#[derive(Debug)]
pub struct NodeService<S> {
    node: WitnessNode<S>,
    rx: mpsc::Receiver<ServiceMessage>,
    events: broadcast::Sender<NodeEvent>,
    timers: TimerManager<ServiceMessage>,
    running: Arc<AtomicBool>,
}

impl<S: CoinStore> NodeService<S> {
    /// Create a new service and its handle
    pub fn new(node: WitnessNode<S>) -> (Self, NodeHandle) {
        let (tx, rx) = mpsc::channel(SERVICE_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let running = Arc::new(AtomicBool::new(true));

        let handle = NodeHandle {
            id: node.id(),
            tx: tx.clone(),
            events: events.clone(),
            running: Arc::clone(&running),
        };
        let service = Self { node, rx, events, timers: TimerManager::new(&tx), running };
        (service, handle)
    }

    /// Run the service loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(target: "tessera::node", witness = %self.node.id(), "Node service started");

        while let Some(message) = self.rx.recv().await {
            let now_ms = unix_millis();
            let result = match message {
                ServiceMessage::Peer { sender, message } => {
                    match self.node.handle_message(sender, message) {
                        Err(err) if err.is_protocol_violation() => {
                            warn!(target: "tessera::node", %sender, %err, "Protocol violation");
                            let reason = err.to_string();
                            let _ = self.events.send(NodeEvent::BanPeer { peer: sender, reason });
                            Ok(())
                        }
                        other => other,
                    }
                }
                ServiceMessage::Timeout(fired) => self.node.handle_timeout(fired, now_ms),
                ServiceMessage::Transaction(tx) => {
                    self.node.submit_transaction(tx);
                    Ok(())
                }
                ServiceMessage::ImportBlock(block) => self.node.import_block(block),
                ServiceMessage::JoinCommittee(committee) => {
                    self.node.join_committee(committee, now_ms)
                }
                ServiceMessage::Shutdown => {
                    info!(target: "tessera::node", "Shutting down node service");
                    self.node.shutdown();
                    self.dispatch();
                    break;
                }
            };

            if let Err(err) = result {
                warn!(target: "tessera::node", %err, "Failed to handle service message");
            }
            self.dispatch();
        }

        self.timers.cancel_all();
        self.running.store(false, Ordering::SeqCst);
        info!(target: "tessera::node", witness = %self.node.id(), "Node service stopped");
    }

    /// Arm timers and publish everything else
    fn dispatch(&mut self) {
        for event in self.node.drain_outbound() {
            match event {
                NodeEvent::ScheduleTimeout { committee, state, round, after } => {
                    self.timers.set_timer(TimerFired { committee, state, round }, after);
                }
                NodeEvent::CancelTimeout { committee } => self.timers.cancel_timer(committee),
                other => {
                    if self.events.send(other).is_err() {
                        debug!(target: "tessera::node", "No event subscribers");
                    }
                }
            }
        }
    }
}

/// Spawn the node service as a background task
pub fn spawn_node_service<S>(node: WitnessNode<S>) -> NodeHandle
where
    S: CoinStore + Send + 'static,
{
    let (service, handle) = NodeService::new(node);

    tokio::spawn(async move {
        service.run().await;
    });

    handle
}

/// Wall clock in unix milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
