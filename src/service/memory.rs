//! In-memory entity store with YAML snapshots

use super::EntityStore;
use crate::model::{Node, Subscription};
use crate::probe::{NodeSource, ProbeReport, ProbeSink};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

/// Serialized form of a store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub subscriptions: Vec<Subscription>,
}

/// Store backed by concurrent maps
#[derive(Default)]
pub struct InMemoryStore {
    nodes: DashMap<Uuid, Node>,
    subscriptions: DashMap<Uuid, Subscription>,
    tokens: DashMap<Uuid, Uuid>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let store = Self::new();
        for node in snapshot.nodes {
            store.insert_node(node)?;
        }
        for sub in snapshot.subscriptions {
            store.insert_subscription(sub)?;
        }
        Ok(store)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_yaml::from_str(content)?;
        Self::from_snapshot(snapshot)
    }

    /// Load a snapshot file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        let store = Self::from_yaml(&content)?;
        info!(
            "Loaded {} nodes and {} subscriptions from {}",
            store.node_count(),
            store.subscription_count(),
            path.as_ref().display()
        );
        Ok(store)
    }

    /// Entities sorted by name, so snapshots are stable
    pub fn snapshot(&self) -> Snapshot {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        let mut subscriptions: Vec<Subscription> =
            self.subscriptions.iter().map(|e| e.value().clone()).collect();
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Snapshot {
            nodes,
            subscriptions,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.snapshot())?)
    }

    /// Write a snapshot file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_yaml()?).await?;
        Ok(())
    }

    /// Add a node; names must be unique.
    pub fn insert_node(&self, node: Node) -> Result<()> {
        node.validate()?;
        if self
            .nodes
            .iter()
            .any(|e| e.key() != &node.id && e.value().name == node.name)
        {
            return Err(Error::validation(format!("node name {} is taken", node.name)));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Add a subscription; tokens must be unique.
    pub fn insert_subscription(&self, sub: Subscription) -> Result<()> {
        sub.validate()?;
        if let Some(owner) = self.tokens.get(&sub.token) {
            if *owner != sub.id {
                return Err(Error::validation(format!(
                    "token of subscription {} is already in use",
                    sub.name
                )));
            }
        }
        let previous = self.subscriptions.get(&sub.id).map(|s| s.token);
        if let Some(old) = previous.filter(|old| *old != sub.token) {
            self.tokens.remove(&old);
        }
        self.tokens.insert(sub.token, sub.id);
        self.subscriptions.insert(sub.id, sub);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.snapshot().nodes
    }

    pub fn all_subscriptions(&self) -> Vec<Subscription> {
        self.snapshot().subscriptions
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(&id).map(|s| s.clone()))
    }

    async fn subscription_by_token(&self, token: Uuid) -> Result<Option<Subscription>> {
        let id = match self.tokens.get(&token) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.subscriptions.get(&id).map(|s| s.clone()))
    }

    async fn node(&self, id: Uuid) -> Result<Option<Node>> {
        Ok(self.nodes.get(&id).map(|n| n.clone()))
    }

    async fn nodes(&self, ids: &[Uuid]) -> Result<Vec<Node>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| n.clone()))
            .collect())
    }

    async fn update_subscription<F>(&self, id: Uuid, f: F) -> Result<Subscription>
    where
        F: FnOnce(&mut Subscription) -> Result<()> + Send,
    {
        let mut entry = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("subscription {}", id)))?;

        let mut updated = entry.value().clone();
        f(&mut updated)?;
        if updated.id != id || updated.token != entry.value().token {
            return Err(Error::validation("update cannot change subscription id or token"));
        }
        updated.validate()?;

        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    async fn update_node<F>(&self, id: Uuid, f: F) -> Result<Node>
    where
        F: FnOnce(&mut Node) -> Result<()> + Send,
    {
        let mut entry = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("node {}", id)))?;

        let mut updated = entry.value().clone();
        f(&mut updated)?;
        if updated.id != id || updated.name != entry.value().name {
            return Err(Error::validation("update cannot change node id or name"));
        }
        updated.validate()?;

        *entry.value_mut() = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl ProbeSink for InMemoryStore {
    async fn commit(&self, report: ProbeReport) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(&report.node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", report.node_id)))?;
        report.apply_to(&mut node);
        debug!("Node {} is {} after probe", node.name, node.status);
        Ok(())
    }
}

#[async_trait]
impl NodeSource for InMemoryStore {
    async fn nodes_to_check(&self) -> Result<Vec<Node>> {
        Ok(self.all_nodes())
    }
}
