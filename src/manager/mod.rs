//! The manager: authoritative ring membership.
//!
//! Accepts storage registrations, answers client hellos with the routing
//! table, tracks heartbeats and expires silent nodes. Every membership
//! change runs exactly one rebalancing pass under the membership lock and is
//! followed by a table broadcast to all storage nodes.
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{event, Level};

use crate::config::ManagerConfig;
use crate::error::Result;
use crate::net::{Message, MessageKind};
use crate::ring::{codec, NodeAddress, RoutingTable};

pub mod rebalance;

pub struct Manager {
    listener: TcpListener,
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    config: ManagerConfig,
    /// The authoritative ring. Held across a whole rebalancing pass so no
    /// other membership mutation can interleave with the data motion.
    membership: tokio::sync::Mutex<RoutingTable>,
    /// Last time each physical node was heard from.
    heartbeats: Mutex<HashMap<String, Instant>>,
}

impl Manager {
    pub async fn bind(config: ManagerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        event!(
            Level::INFO,
            "manager listening on {} with replication factor {}",
            listener.local_addr()?,
            config.replication_factor
        );

        let replication_factor = config.replication_factor.max(1);
        Ok(Self {
            listener,
            inner: Arc::new(ManagerInner {
                membership: tokio::sync::Mutex::new(RoutingTable::new(replication_factor)),
                heartbeats: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<NodeAddress> {
        let addr = self.listener.local_addr()?;
        Ok(NodeAddress {
            host: self.inner.config.host.clone(),
            port: addr.port(),
        })
    }

    /// Serves requests until the shutdown future resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Manager { listener, inner } = self;
        let monitor = tokio::spawn(monitor_heartbeats(Arc::clone(&inner)));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(Arc::clone(&inner), stream));
                    }
                    Err(err) => event!(Level::WARN, "accept failed: {}", err),
                }
            }
        }

        monitor.abort();
        Ok(())
    }
}

async fn handle_connection(inner: Arc<ManagerInner>, mut stream: TcpStream) {
    let request = match Message::try_from_async_read(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            event!(Level::WARN, "failed to read request: {}", err);
            return;
        }
    };

    match request.kind {
        MessageKind::StorageRegister => {
            if let Err(err) = inner.handle_register(stream, &request).await {
                event!(Level::WARN, "storage registration failed: {}", err);
            }
        }
        MessageKind::ClientHello => {
            let payload = {
                let membership = inner.membership.lock().await;
                codec::build_table_payload(&membership)
            };
            let reply = Message::new(MessageKind::TablePush, payload);
            if let Err(err) = stream.write_all(&reply.serialize()).await {
                event!(Level::WARN, "failed to send table to client: {}", err);
            }
        }
        MessageKind::Heartbeat => match request.payload_str() {
            Ok(node_id) => {
                inner.stamp_heartbeat(node_id);
                let reply = Message::new(MessageKind::HeartbeatAck, Bytes::from_static(b"ok"));
                if let Err(err) = stream.write_all(&reply.serialize()).await {
                    event!(Level::DEBUG, "failed to ack heartbeat: {}", err);
                }
            }
            Err(err) => event!(Level::WARN, "heartbeat with bad payload: {}", err),
        },
        other => event!(Level::WARN, "unhandled message type {:?}", other),
    }
}

impl ManagerInner {
    /// Registration replaces the node's virtual entries atomically, answers
    /// with the post-join table and only then - reply socket closed - moves
    /// keys and broadcasts, all under the membership lock.
    async fn handle_register(&self, mut stream: TcpStream, request: &Message) -> Result<()> {
        let (node_id, address) = codec::parse_register_payload(request.payload_str()?)?;

        let mut membership = self.membership.lock().await;
        membership.insert_physical(&node_id, address.clone());
        self.stamp_heartbeat(&node_id);
        event!(
            Level::INFO,
            "registered storage {} at {}, ring now has {} nodes",
            node_id,
            address,
            membership.distinct_physical_count()
        );

        let reply = Message::new(
            MessageKind::TablePush,
            codec::build_table_payload(&membership),
        );
        stream.write_all(&reply.serialize()).await?;
        drop(stream);

        if membership.distinct_physical_count() > 1 {
            rebalance::on_join(&membership, &node_id, &self.config).await;
        }

        let snapshot = membership.clone();
        drop(membership);
        rebalance::broadcast_table(&snapshot).await;

        Ok(())
    }

    fn stamp_heartbeat(&self, node_id: &str) {
        if let Ok(mut guard) = self.heartbeats.lock() {
            guard.insert(node_id.to_string(), Instant::now());
        }
    }

    /// Physical nodes in the ring whose last heartbeat is older than the
    /// failure timeout (or that never sent one).
    fn expired_nodes(&self, membership: &RoutingTable, timeout: Duration) -> BTreeSet<String> {
        let now = Instant::now();
        let Ok(guard) = self.heartbeats.lock() else {
            return BTreeSet::new();
        };

        membership
            .physicals()
            .into_iter()
            .map(|(node_id, _)| node_id)
            .filter(|node_id| match guard.get(node_id) {
                Some(last_seen) => now.duration_since(*last_seen) > timeout,
                None => true,
            })
            .collect()
    }
}

async fn monitor_heartbeats(inner: Arc<ManagerInner>) {
    let interval = Duration::from_millis(inner.config.detection_interval_ms);
    let timeout = Duration::from_millis(inner.config.failure_timeout_ms);

    loop {
        tokio::time::sleep(interval).await;

        let mut membership = inner.membership.lock().await;
        let expired = inner.expired_nodes(&membership, timeout);
        if expired.is_empty() {
            continue;
        }
        event!(
            Level::WARN,
            "nodes expired without heartbeat: {:?}, triggering rebalancing",
            expired
        );

        let ring_before = membership.clone();
        let mut ring_after = membership.clone();
        for node_id in &expired {
            ring_after.remove_physical(node_id);
        }

        // move the lost replicas while the failed entries are still part of
        // the authoritative table, then drop them in one step
        rebalance::on_failure(&ring_before, &ring_after, &expired, &inner.config).await;

        *membership = ring_after;
        if let Ok(mut guard) = inner.heartbeats.lock() {
            for node_id in &expired {
                guard.remove(node_id);
            }
        }

        let snapshot = membership.clone();
        drop(membership);
        rebalance::broadcast_table(&snapshot).await;
    }
}
