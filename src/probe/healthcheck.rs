//! Node health checks
//!
//! Batches fan out one task per node, capped by a semaphore. A node that is
//! still being probed is skipped instead of probed twice. Every outcome is
//! committed on its own, so one failing node never holds up the rest.

use super::{probe_with, Dialer, ProbeError, TcpDialer};
use crate::model::Node;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of probing one node
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub node_id: Uuid,
    pub checked_at: DateTime<Utc>,
    /// Latency in milliseconds, or why the probe failed
    pub outcome: std::result::Result<u32, ProbeError>,
}

impl ProbeReport {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Write the outcome into the node's health fields.
    pub fn apply_to(&self, node: &mut Node) {
        match &self.outcome {
            Ok(ms) => node.record_latency(*ms, self.checked_at),
            Err(e) => node.mark_error(e.to_string(), self.checked_at),
        }
    }
}

/// Receives probe outcomes, one commit per node
#[async_trait]
pub trait ProbeSink: Send + Sync {
    async fn commit(&self, report: ProbeReport) -> Result<()>;
}

/// Supplies the nodes checked on each tick of the background loop
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn nodes_to_check(&self) -> Result<Vec<Node>>;
}

/// Handle on a dispatched batch
#[derive(Debug)]
pub struct BatchTicket {
    dispatched: usize,
    skipped: usize,
    handles: Vec<JoinHandle<()>>,
}

impl BatchTicket {
    /// Nodes a probe task was spawned for
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Nodes left alone because a probe was already running
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Wait for every probe of the batch. Returns how many tasks finished
    /// without panicking.
    pub async fn wait(self) -> usize {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count()
    }
}

/// Removes a node from the in-flight set when its probe task ends
struct InFlightGuard {
    in_flight: Arc<DashMap<Uuid, DateTime<Utc>>>,
    node_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.node_id);
    }
}

/// Concurrent TCP health checker
pub struct HealthChecker {
    dialer: Arc<dyn Dialer>,
    timeout: Duration,
    interval: Duration,
    limiter: Arc<Semaphore>,
    in_flight: Arc<DashMap<Uuid, DateTime<Utc>>>,
    running: AtomicBool,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl HealthChecker {
    pub fn new(timeout: Duration, concurrency: usize, interval: Duration) -> Self {
        Self::with_dialer(Arc::new(TcpDialer), timeout, concurrency, interval)
    }

    pub fn with_dialer(
        dialer: Arc<dyn Dialer>,
        timeout: Duration,
        concurrency: usize,
        interval: Duration,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);

        HealthChecker {
            dialer,
            timeout,
            interval,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(DashMap::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the background loop is enabled
    pub fn is_auto(&self) -> bool {
        self.interval > Duration::ZERO
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a probe for `node_id` is currently running
    pub fn is_in_flight(&self, node_id: &Uuid) -> bool {
        self.in_flight.contains_key(node_id)
    }

    fn claim(&self, node_id: Uuid) -> Option<InFlightGuard> {
        if self.in_flight.insert(node_id, Utc::now()).is_some() {
            return None;
        }
        Some(InFlightGuard {
            in_flight: self.in_flight.clone(),
            node_id,
        })
    }

    /// Probe every node in the background and return at once.
    pub fn check_batch(&self, nodes: Vec<Node>, sink: Arc<dyn ProbeSink>) -> BatchTicket {
        let mut handles = Vec::with_capacity(nodes.len());
        let mut skipped = 0;

        for node in nodes {
            let Some(guard) = self.claim(node.id) else {
                debug!("Node {} already being probed, skipping", node.name);
                skipped += 1;
                continue;
            };

            let dialer = self.dialer.clone();
            let limiter = self.limiter.clone();
            let sink = sink.clone();
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let _guard = guard;
                let report = match limiter.acquire_owned().await {
                    Ok(_permit) => run_probe(dialer.as_ref(), &node, timeout).await,
                    Err(_) => return,
                };
                if let Err(e) = sink.commit(report).await {
                    warn!("Failed to commit probe of node {}: {}", node.name, e);
                }
            }));
        }

        let ticket = BatchTicket {
            dispatched: handles.len(),
            skipped,
            handles,
        };
        info!("{} probes dispatched, {} skipped", ticket.dispatched, ticket.skipped);
        ticket
    }

    /// Probe one node and wait for the result. `None` if the node is
    /// already being probed.
    pub async fn check_node(&self, node: &Node) -> Option<ProbeReport> {
        let _guard = self.claim(node.id)?;
        let _permit = self.limiter.acquire().await.ok()?;
        Some(run_probe(self.dialer.as_ref(), node, self.timeout).await)
    }

    /// Run batches from `source` every interval until [`HealthChecker::close`].
    /// Returns at once if the checker was already closed.
    pub async fn start(&self, source: Arc<dyn NodeSource>, sink: Arc<dyn ProbeSink>) {
        if !self.is_auto() || self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        // Subscribe before reading `closed`; close() sets it before sending.
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            debug!("Health checker closed before start");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match source.nodes_to_check().await {
                        Ok(nodes) => {
                            self.check_batch(nodes, sink.clone());
                        }
                        Err(e) => warn!("Cannot load nodes for health check: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("Health check loop stopped");
    }

    /// Stop the background loop, including one that has not started yet
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }
}

async fn run_probe(dialer: &dyn Dialer, node: &Node, timeout: Duration) -> ProbeReport {
    let outcome = probe_with(dialer, &node.host, node.port, timeout).await;
    match &outcome {
        Ok(ms) => debug!("Node {} reachable in {}ms", node.name, ms),
        Err(e) => debug!("Node {} unreachable: {}", node.name, e),
    }
    ProbeReport {
        node_id: node.id,
        checked_at: Utc::now(),
        outcome,
    }
}
