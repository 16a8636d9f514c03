//! Subscription retrieval
//!
//! Glue between an entity store and the engine: refresh lifecycle state,
//! guard, parse, synthesize and account for the access.

mod memory;

pub use memory::{InMemoryStore, Snapshot};

use crate::descriptor::Parser;
use crate::document::{ConfigDocument, Synthesizer};
use crate::lifecycle::{self, Status};
use crate::model::{Node, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persistence the service reads from and writes back to
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>>;

    async fn subscription_by_token(&self, token: Uuid) -> Result<Option<Subscription>>;

    async fn node(&self, id: Uuid) -> Result<Option<Node>>;

    /// Nodes for `ids` in the same order; unknown ids are left out.
    async fn nodes(&self, ids: &[Uuid]) -> Result<Vec<Node>>;

    /// Apply `f` to the stored subscription as one atomic step and return
    /// the new state. Nothing is written when `f` fails.
    async fn update_subscription<F>(&self, id: Uuid, f: F) -> Result<Subscription>
    where
        F: FnOnce(&mut Subscription) -> Result<()> + Send;

    /// Node counterpart of [`EntityStore::update_subscription`]
    async fn update_node<F>(&self, id: Uuid, f: F) -> Result<Node>
    where
        F: FnOnce(&mut Node) -> Result<()> + Send;
}

/// Usage figures of one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubscriptionStats {
    pub status: Status,
    pub total_bandwidth: u64,
    pub bandwidth_limit: Option<u64>,
    pub access_count: u64,
    pub last_access_at: Option<DateTime<Utc>>,
    pub last_access_ip: Option<String>,
    /// Members, enabled or not
    pub node_count: usize,
    /// Members whose node is active
    pub active_node_count: usize,
}

impl SubscriptionStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Renders subscriptions on request
pub struct SubscriptionService<S: EntityStore> {
    store: Arc<S>,
    parser: Parser,
    synthesizer: Synthesizer,
}

impl<S: EntityStore> SubscriptionService<S> {
    pub fn new(store: Arc<S>, parser: Parser, synthesizer: Synthesizer) -> Self {
        SubscriptionService {
            store,
            parser,
            synthesizer,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Render the document for `token`, counting the access only when
    /// rendering succeeds.
    pub async fn retrieve(&self, token: Uuid, ip: &str, now: DateTime<Utc>) -> Result<ConfigDocument> {
        let found = self
            .store
            .subscription_by_token(token)
            .await?
            .ok_or_else(|| Error::not_found("no subscription for this token"))?;

        let sub = self
            .store
            .update_subscription(found.id, move |s| {
                if lifecycle::refresh(s, now) {
                    debug!("Subscription {} is now {}", s.name, s.status);
                }
                Ok(())
            })
            .await?;
        lifecycle::ensure_renderable(&sub, now)?;

        let nodes = self.active_nodes(&sub, now).await?;
        let mut descriptors = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match node.parse_descriptor(&self.parser) {
                Ok(d) => descriptors.push(d),
                Err(e) => warn!("Skipping node {} in subscription {}: {}", node.name, sub.name, e),
            }
        }

        let doc = self.synthesizer.synthesize(&descriptors)?;

        // Traffic may have landed while rendering; guard again with the count.
        let client = ip.to_string();
        self.store
            .update_subscription(sub.id, move |s| {
                lifecycle::refresh(s, now);
                lifecycle::ensure_renderable(&*s, now)?;
                s.record_access(client, now);
                Ok(())
            })
            .await?;
        info!(
            "Rendered subscription {} with {} proxies for {}",
            sub.name,
            doc.proxies.len(),
            ip
        );
        Ok(doc)
    }

    /// Enabled members whose node is active after a lifecycle refresh
    async fn active_nodes(&self, sub: &Subscription, now: DateTime<Utc>) -> Result<Vec<Node>> {
        let ids: Vec<Uuid> = sub.enabled_node_ids().collect();
        let mut active = Vec::with_capacity(ids.len());

        for node in self.store.nodes(&ids).await? {
            let node = if lifecycle::derive_status(&node, now) == node.status {
                node
            } else {
                match self
                    .store
                    .update_node(node.id, move |n| {
                        lifecycle::refresh(n, now);
                        Ok(())
                    })
                    .await
                {
                    Ok(updated) => updated,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            };

            if node.status == Status::Active {
                active.push(node);
            } else {
                debug!("Leaving out node {} ({})", node.name, node.status);
            }
        }
        Ok(active)
    }

    /// Account `bytes` of traffic by subscription `subscription_id` through
    /// node `node_id`.
    pub async fn record_traffic(
        &self,
        subscription_id: Uuid,
        node_id: Uuid,
        bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        if self.store.node(node_id).await?.is_none() {
            return Err(Error::not_found(format!("node {}", node_id)));
        }

        let sub = self
            .store
            .update_subscription(subscription_id, move |s| s.record_traffic(node_id, bytes, now))
            .await?;
        self.store
            .update_node(node_id, move |n| {
                n.add_bandwidth(bytes, now);
                Ok(())
            })
            .await?;
        Ok(sub)
    }

    /// Usage totals and member counts of a subscription
    pub async fn stats(&self, subscription_id: Uuid) -> Result<SubscriptionStats> {
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("subscription {}", subscription_id)))?;

        let ids: Vec<Uuid> = sub.members.iter().map(|m| m.node_id).collect();
        let active_node_count = self
            .store
            .nodes(&ids)
            .await?
            .iter()
            .filter(|n| n.status == Status::Active)
            .count();

        Ok(SubscriptionStats {
            status: sub.status,
            total_bandwidth: sub.bandwidth_used,
            bandwidth_limit: sub.bandwidth_limit,
            access_count: sub.access_count,
            last_access_at: sub.last_access_at,
            last_access_ip: sub.last_access_ip,
            node_count: sub.members.len(),
            active_node_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Refusal;
    use crate::model::{Country, MembershipState};
    use chrono::Duration;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    struct Fixture {
        service: SubscriptionService<InMemoryStore>,
        sub: Subscription,
        nodes: Vec<Node>,
    }

    fn fixture() -> Fixture {
        let parser = Parser::default();
        let store = Arc::new(InMemoryStore::new());

        let nodes = vec![
            Node::from_descriptor(&parser, "Tokyo", format!("vless://{}@jp.example.com:443", UUID), Country::Jp).unwrap(),
            Node::from_descriptor(&parser, "Seoul", "10.0.0.2:1080:u:p", Country::Kr).unwrap(),
            Node::from_descriptor(&parser, "Taipei", "10.0.0.3:1080:u:p", Country::Tw).unwrap(),
        ];
        let mut sub = Subscription::new(Uuid::new_v4(), "home", 10).unwrap();
        for node in &nodes {
            store.insert_node(node.clone()).unwrap();
            sub.add_node(node.id).unwrap();
        }
        store.insert_subscription(sub.clone()).unwrap();

        Fixture {
            service: SubscriptionService::new(store, parser, Synthesizer::default()),
            sub,
            nodes,
        }
    }

    async fn stored(f: &Fixture) -> Subscription {
        f.service.store().subscription(f.sub.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_retrieve_renders_and_counts() {
        let f = fixture();
        let now = Utc::now();

        let doc = f.service.retrieve(f.sub.token, "203.0.113.1", now).await.unwrap();
        assert_eq!(doc.proxies.len(), 3);

        let sub = stored(&f).await;
        assert_eq!(sub.access_count, 1);
        assert_eq!(sub.last_access_ip.as_deref(), Some("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let f = fixture();
        let err = f.service.retrieve(Uuid::new_v4(), "ip", Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_subscription_is_refused_without_counting() {
        let f = fixture();
        let now = Utc::now();
        let mut sub = f.sub.clone();
        sub.expire_at = Some(now - Duration::hours(1));
        f.service.store().insert_subscription(sub.clone()).unwrap();

        let err = f.service.retrieve(sub.token, "ip", now).await.unwrap_err();
        assert!(matches!(err, Error::Refused(Refusal::Expired)));

        let stored = stored(&f).await;
        assert_eq!(stored.status, Status::Inactive);
        assert_eq!(stored.access_count, 0);
    }

    #[tokio::test]
    async fn test_inactive_and_disabled_members_left_out() {
        let f = fixture();
        let now = Utc::now();
        let store = f.service.store();

        store
            .update_node(f.nodes[1].id, |n| {
                n.mark_error("connection refused", now);
                Ok(())
            })
            .await
            .unwrap();
        let disabled = f.nodes[2].id;
        store
            .update_subscription(f.sub.id, move |s| {
                if let Some(m) = s.member_mut(disabled) {
                    m.state = MembershipState::Disabled;
                }
                Ok(())
            })
            .await
            .unwrap();

        let doc = f.service.retrieve(f.sub.token, "ip", now).await.unwrap();
        assert_eq!(
            doc.proxy_names().collect::<Vec<_>>(),
            vec!["vless-jp.example.com-443"]
        );
        assert_eq!(stored(&f).await.members.len(), 3);
    }

    #[tokio::test]
    async fn test_expired_node_is_refreshed_and_left_out() {
        let f = fixture();
        let now = Utc::now();
        let mut expired = f.nodes[0].clone();
        expired.expire_at = Some(now - Duration::minutes(1));
        f.service.store().insert_node(expired).unwrap();

        let doc = f.service.retrieve(f.sub.token, "ip", now).await.unwrap();
        assert_eq!(doc.proxies.len(), 2);
        let node = f.service.store().node(f.nodes[0].id).await.unwrap().unwrap();
        assert_eq!(node.status, Status::Inactive);
    }

    #[tokio::test]
    async fn test_broken_descriptor_is_skipped() {
        let f = fixture();
        let mut broken = f.nodes[0].clone();
        broken.descriptor = "vless://not-a-uuid@jp.example.com:443".to_string();
        f.service.store().insert_node(broken).unwrap();

        let doc = f.service.retrieve(f.sub.token, "ip", Utc::now()).await.unwrap();
        assert_eq!(doc.proxies.len(), 2);
    }

    #[tokio::test]
    async fn test_record_traffic_exhausts_quota() {
        let f = fixture();
        let now = Utc::now();
        let mut sub = f.sub.clone();
        sub.bandwidth_limit = Some(1_000);
        f.service.store().insert_subscription(sub.clone()).unwrap();

        let sub = f.service.record_traffic(sub.id, f.nodes[0].id, 1_000, now).await.unwrap();
        assert_eq!(sub.status, Status::Inactive);
        assert_eq!(sub.member(f.nodes[0].id).unwrap().bandwidth_used, 1_000);

        let node = f.service.store().node(f.nodes[0].id).await.unwrap().unwrap();
        assert_eq!(node.bandwidth_used, 1_000);

        let err = f.service.retrieve(sub.token, "ip", now).await.unwrap_err();
        assert!(matches!(err, Error::Refused(Refusal::OverQuota)));
    }

    #[tokio::test]
    async fn test_record_traffic_for_non_member_writes_nothing() {
        let f = fixture();
        let parser = Parser::default();
        let outsider = Node::from_descriptor(&parser, "Outsider", "10.0.0.9:1080:u:p", Country::Us).unwrap();
        f.service.store().insert_node(outsider.clone()).unwrap();

        let err = f
            .service
            .record_traffic(f.sub.id, outsider.id, 10, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(stored(&f).await.bandwidth_used, 0);
        let node = f.service.store().node(outsider.id).await.unwrap().unwrap();
        assert_eq!(node.bandwidth_used, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_updates_are_not_lost() {
        let f = fixture();
        let service = Arc::new(f.service);
        let token = f.sub.token;
        let sub_id = f.sub.id;
        let node_id = f.nodes[1].id;
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..400 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    service.retrieve(token, "198.51.100.7", now).await.map(|_| ())
                } else {
                    service.record_traffic(sub_id, node_id, 10, now).await.map(|_| ())
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sub = service.store().subscription(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.access_count, 200);
        assert_eq!(sub.bandwidth_used, 2_000);
        assert_eq!(sub.member(node_id).unwrap().bandwidth_used, 2_000);
        let node = service.store().node(node_id).await.unwrap().unwrap();
        assert_eq!(node.bandwidth_used, 2_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_quota_holds_under_concurrent_traffic() {
        let f = fixture();
        let now = Utc::now();
        let mut limited = f.sub.clone();
        limited.bandwidth_limit = Some(1_000);
        f.service.store().insert_subscription(limited).unwrap();

        let service = Arc::new(f.service);
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let service = service.clone();
                let (sub_id, node_id) = (f.sub.id, f.nodes[0].id);
                tokio::spawn(async move { service.record_traffic(sub_id, node_id, 10, now).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let err = service.retrieve(f.sub.token, "ip", now).await.unwrap_err();
        assert!(matches!(err, Error::Refused(Refusal::OverQuota)));
        let sub = service.store().subscription(f.sub.id).await.unwrap().unwrap();
        assert_eq!(sub.bandwidth_used, 1_000);
        assert_eq!(sub.access_count, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let f = fixture();
        let now = Utc::now();
        f.service
            .store()
            .update_node(f.nodes[2].id, |n| {
                n.mark_error("timed out after 5s", now);
                Ok(())
            })
            .await
            .unwrap();
        f.service.record_traffic(f.sub.id, f.nodes[0].id, 512, now).await.unwrap();
        f.service.retrieve(f.sub.token, "192.0.2.10", now).await.unwrap();

        let stats = f.service.stats(f.sub.id).await.unwrap();
        assert_eq!(stats.status, Status::Active);
        assert_eq!(stats.total_bandwidth, 512);
        assert_eq!(stats.bandwidth_limit, None);
        assert_eq!(stats.access_count, 1);
        assert_eq!(stats.last_access_ip.as_deref(), Some("192.0.2.10"));
        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.active_node_count, 2);

        let json = stats.to_json().unwrap();
        assert!(json.contains("\"active-node-count\": 2"));

        let missing = f.service.stats(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));
    }
}
