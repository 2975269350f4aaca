//! The storage node.
//!
//! Serves client reads and writes, acts as the write primary that fans a PUT
//! out to the other replicas of the key, and answers the manager's bulk
//! get/put/delete plus the pause/availability traffic used while keys are
//! being moved. One inbound connection carries one request.
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{event, Level};

use crate::config::{StorageConfig, MAX_KEY_BYTES, MAX_VALUE_BYTES};
use crate::error::{Error, Result};
use crate::net::{self, Message, MessageKind};
use crate::ring::{codec, NodeAddress, RoutingTable, VirtualNode};

pub mod locks;
pub mod store;

use self::locks::LockTable;
use self::store::{InMemory, StorageEngine};

const MUTEX_ERR: &str = "Unable to acquire storage state mutex. This should never happen";

pub struct StorageNode {
    listener: TcpListener,
    inner: Arc<NodeInner>,
}

#[derive(Debug)]
struct NodeInner {
    node_id: String,
    advertised_addr: NodeAddress,
    manager_addr: NodeAddress,
    heartbeat_interval: Duration,
    engine: Arc<dyn StorageEngine>,
    locks: LockTable,
    /// While paused, client traffic is refused; manager traffic still flows.
    paused: Mutex<bool>,
    /// Snapshot pushed by the manager, used to compute the replica fanout.
    table: Mutex<Option<RoutingTable>>,
}

impl StorageNode {
    /// Binds the listener. The advertised port is read back from the socket
    /// so that configs may ask for an ephemeral port.
    pub async fn bind(config: StorageConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listener,
            inner: Arc::new(NodeInner {
                node_id: config.node_id.clone(),
                advertised_addr: NodeAddress {
                    host: config.host.clone(),
                    port,
                },
                manager_addr: config.manager_addr(),
                heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
                engine: Arc::new(InMemory::default()),
                locks: LockTable::default(),
                paused: Mutex::new(false),
                table: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> NodeAddress {
        self.inner.advertised_addr.clone()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Registers with the manager, then serves requests until the shutdown
    /// future resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let StorageNode { listener, inner } = self;

        register_with_manager(&inner).await?;
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&inner)));
        event!(
            Level::INFO,
            "storage node {} serving on {}",
            inner.node_id,
            inner.advertised_addr
        );

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

        heartbeat.abort();
        Ok(())
    }
}

async fn register_with_manager(inner: &NodeInner) -> Result<()> {
    let payload = codec::build_register_payload(&inner.node_id, &inner.advertised_addr);
    let reply = net::round_trip(
        &inner.manager_addr,
        MessageKind::StorageRegister,
        &payload,
    )
    .await?;
    let table_payload = net::expect_kind(reply, MessageKind::TablePush)?;

    let text = String::from_utf8(table_payload.to_vec()).map_err(|err| Error::BadFormat {
        reason: format!("table payload is not valid utf8: {}", err),
    })?;
    let table = codec::parse_table_payload(&text)?;
    event!(
        Level::INFO,
        "registered with manager, table has {} nodes at replication {}",
        table.distinct_physical_count(),
        table.replication_factor()
    );
    inner.install_table(table)
}

async fn heartbeat_loop(inner: Arc<NodeInner>) {
    loop {
        tokio::time::sleep(inner.heartbeat_interval).await;

        match net::connect(&inner.manager_addr).await {
            Ok(mut stream) => {
                if let Err(err) =
                    net::send_message(&mut stream, MessageKind::Heartbeat, &inner.node_id).await
                {
                    event!(Level::DEBUG, "heartbeat send failed: {}", err);
                    continue;
                }
                let _ = net::recv_message(&mut stream).await;
            }
            Err(err) => {
                event!(Level::DEBUG, "manager unreachable for heartbeat: {}", err);
            }
        }
    }
}

async fn handle_connection(inner: Arc<NodeInner>, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let request = match Message::try_from_async_read(&mut stream).await {
        Ok(request) => request,
        Err(Error::UnknownType { id }) => {
            event!(Level::WARN, "unknown message type {} from {}", id, peer);
            let reply = Message::new(MessageKind::Error, Bytes::from_static(b"unknown"));
            let _ = stream.write_all(&reply.serialize()).await;
            return;
        }
        Err(err) => {
            event!(Level::WARN, "failed to read request from {}: {}", peer, err);
            return;
        }
    };

    let reply = inner.dispatch(request, &peer).await;
    if let Err(err) = stream.write_all(&reply.serialize()).await {
        event!(Level::WARN, "failed to write reply to {}: {}", peer, err);
    }
}

impl NodeInner {
    async fn dispatch(&self, request: Message, peer: &str) -> Message {
        match self.try_dispatch(&request, peer).await {
            Ok(reply) => reply,
            Err(err) => {
                event!(
                    Level::WARN,
                    "{:?} from {} failed: {}",
                    request.kind,
                    peer,
                    err
                );
                Message::new(MessageKind::Error, Bytes::from(err.wire_reason()))
            }
        }
    }

    async fn try_dispatch(&self, request: &Message, peer: &str) -> Result<Message> {
        match request.kind {
            MessageKind::ClientPut => {
                self.ensure_unpaused()?;
                self.primary_put(request.payload_str()?, peer).await
            }
            MessageKind::ReplPut => self.replica_put(request.payload_str()?).await,
            MessageKind::ClientGet => {
                self.ensure_unpaused()?;
                self.client_get(request.payload_str()?).await
            }
            MessageKind::ClientDelete => {
                self.ensure_unpaused()?;
                self.delete_keys(request.payload_str()?).await
            }
            MessageKind::ManagerGet => self.manager_get(request.payload_str()?).await,
            MessageKind::ManagerDelete => self.delete_keys(request.payload_str()?).await,
            MessageKind::GetAllKeys => self.all_keys().await,
            MessageKind::PauseNode => {
                self.set_paused(true)?;
                Ok(Message::new(MessageKind::PauseAck, Bytes::from_static(b"ok")))
            }
            MessageKind::ResumeNode => {
                self.set_paused(false)?;
                Ok(Message::new(
                    MessageKind::ResumeAck,
                    Bytes::from_static(b"ok"),
                ))
            }
            MessageKind::AvailabilityCheck => {
                let status = if self.locks.is_idle()? { "yes" } else { "no" };
                Ok(Message::new(
                    MessageKind::AvailableStatus,
                    Bytes::from(status),
                ))
            }
            MessageKind::TablePush => {
                let table = codec::parse_table_payload(request.payload_str()?)?;
                event!(
                    Level::INFO,
                    "table push: {} nodes at replication {}",
                    table.distinct_physical_count(),
                    table.replication_factor()
                );
                self.install_table(table)?;
                Ok(Message::new(
                    MessageKind::HeartbeatAck,
                    Bytes::from_static(b"ok"),
                ))
            }
            other => Err(Error::UnknownType {
                id: other.as_u16(),
            }),
        }
    }

    /// The primary write path: take every lock or refuse, write locally,
    /// fan out to the remaining replicas, release, acknowledge. The local
    /// write alone makes the operation durable; replica failures are logged
    /// (unless the `strict-replication` feature is enabled).
    async fn primary_put(&self, payload: &str, peer: &str) -> Result<Message> {
        let pairs = codec::parse_put_payload(payload)?;
        for (key, value) in &pairs {
            validate_key(key)?;
            validate_value(value)?;
        }

        let mut held: Vec<Bytes> = Vec::with_capacity(pairs.len());
        for (key, _) in &pairs {
            if !self.locks.try_acquire(key.clone(), peer)? {
                self.locks.release_many(&held)?;
                return Err(Error::Locked {
                    key: String::from_utf8_lossy(key).into_owned(),
                });
            }
            held.push(key.clone());
        }

        let outcome = self.write_and_replicate(&pairs, payload).await;
        self.locks.release_many(&held)?;
        outcome?;

        Ok(Message::new(MessageKind::PutOk, Bytes::from_static(b"ok")))
    }

    async fn write_and_replicate(&self, pairs: &[(Bytes, Bytes)], payload: &str) -> Result<()> {
        for (key, value) in pairs {
            self.engine.put(key.clone(), value.clone()).await?;
        }

        // every key of a batch shares a preference list, so the first key
        // determines the fanout
        let Some(table) = self.table_snapshot()? else {
            return Ok(());
        };
        let replicas: Vec<VirtualNode> = table
            .preference_list(&pairs[0].0)
            .into_iter()
            .filter(|replica| replica.node_id != self.node_id)
            .collect();
        if replicas.is_empty() {
            return Ok(());
        }

        let total = replicas.len();
        let mut futures = FuturesUnordered::new();
        for replica in replicas {
            futures.push(replicate_to(replica, payload.to_string()));
        }

        let mut failures = 0usize;
        while let Some(result) = futures.next().await {
            if let Err((node_id, err)) = result {
                failures += 1;
                event!(Level::WARN, "replica PUT to {} failed: {}", node_id, err);
            }
        }

        if failures > 0 {
            event!(
                Level::WARN,
                "{} of {} replicas did not acknowledge the write",
                failures,
                total
            );
            if cfg!(feature = "strict-replication") {
                return Err(Error::Transport {
                    reason: format!("{} of {} replicas did not acknowledge", failures, total),
                });
            }
        }

        Ok(())
    }

    /// The replica write path: no locks, no further fanout.
    async fn replica_put(&self, payload: &str) -> Result<Message> {
        let pairs = codec::parse_put_payload(payload)?;
        for (key, value) in &pairs {
            validate_key(key)?;
            validate_value(value)?;
        }

        for (key, value) in pairs {
            self.engine.put(key, value).await?;
        }

        Ok(Message::new(MessageKind::PutOk, Bytes::from_static(b"ok")))
    }

    async fn client_get(&self, payload: &str) -> Result<Message> {
        validate_key(payload.as_bytes())?;

        match self.engine.get(payload.as_bytes()).await? {
            Some(value) => Ok(Message::new(MessageKind::GetOk, value)),
            None => Err(Error::NotFound {
                key: payload.to_string(),
            }),
        }
    }

    async fn delete_keys(&self, payload: &str) -> Result<Message> {
        let keys = codec::split_keys(payload);
        self.engine.delete_many(&keys).await?;

        Ok(Message::new(
            MessageKind::DeleteOk,
            Bytes::from_static(b"ok"),
        ))
    }

    /// Batched read for the manager; fails if any requested key is absent so
    /// a rebalance never silently moves a hole.
    async fn manager_get(&self, payload: &str) -> Result<Message> {
        let keys = codec::split_keys(payload);
        let values = self.engine.multi_get(&keys).await?;

        let mut out = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            match value {
                Some(value) => out.push(String::from_utf8_lossy(&value).into_owned()),
                None => {
                    return Err(Error::NotFound {
                        key: String::from_utf8_lossy(key).into_owned(),
                    })
                }
            }
        }

        Ok(Message::new(MessageKind::GetOk, out.join(";")))
    }

    async fn all_keys(&self) -> Result<Message> {
        let keys = self.engine.keys().await?;
        let joined = keys
            .iter()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .collect::<Vec<_>>()
            .join(",");

        Ok(Message::new(MessageKind::AllKeys, joined))
    }

    fn ensure_unpaused(&self) -> Result<()> {
        let guard = self.paused.lock().map_err(|_| Error::Logic {
            reason: MUTEX_ERR.to_string(),
        })?;
        if *guard {
            return Err(Error::NodePaused);
        }
        Ok(())
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let mut guard = self.paused.lock().map_err(|_| Error::Logic {
            reason: MUTEX_ERR.to_string(),
        })?;
        if *guard != paused {
            event!(Level::INFO, "node {} paused={}", self.node_id, paused);
        }
        *guard = paused;
        Ok(())
    }

    fn install_table(&self, table: RoutingTable) -> Result<()> {
        let mut guard = self.table.lock().map_err(|_| Error::Logic {
            reason: MUTEX_ERR.to_string(),
        })?;
        *guard = Some(table);
        Ok(())
    }

    fn table_snapshot(&self) -> Result<Option<RoutingTable>> {
        let guard = self.table.lock().map_err(|_| Error::Logic {
            reason: MUTEX_ERR.to_string(),
        })?;
        Ok(guard.clone())
    }
}

async fn replicate_to(
    replica: VirtualNode,
    payload: String,
) -> std::result::Result<(), (String, Error)> {
    let result: Result<()> = async {
        let mut stream = net::connect(&replica.address).await?;
        net::send_message(&mut stream, MessageKind::ReplPut, &payload).await?;
        let reply = net::recv_message(&mut stream).await?;
        net::expect_kind(reply, MessageKind::PutOk)?;
        Ok(())
    }
    .await;

    result.map_err(|err| (replica.node_id, err))
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::BadKey {
            reason: "key is empty".to_string(),
        });
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::BadKey {
            reason: format!("key is {} bytes, max is {}", key.len(), MAX_KEY_BYTES),
        });
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(Error::BadValue {
            reason: format!("value is {} bytes, max is {}", value.len(), MAX_VALUE_BYTES),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::store::InMemory;
    use super::{LockTable, Message, MessageKind, NodeAddress, NodeInner};
    use crate::ring::{codec, RoutingTable};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn test_node() -> NodeInner {
        NodeInner {
            node_id: "test-node".to_string(),
            advertised_addr: NodeAddress {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            manager_addr: NodeAddress {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            heartbeat_interval: Duration::from_secs(2),
            engine: Arc::new(InMemory::default()),
            locks: LockTable::default(),
            paused: Mutex::new(false),
            table: Mutex::new(None),
        }
    }

    fn error_reason(reply: &Message) -> &str {
        assert_eq!(reply.kind, MessageKind::Error);
        std::str::from_utf8(&reply.payload).unwrap()
    }

    #[tokio::test]
    async fn put_then_get() {
        let node = test_node();

        let reply = node
            .dispatch(Message::new(MessageKind::ClientPut, "key1|v1,v2"), "peer-1")
            .await;
        assert_eq!(reply.kind, MessageKind::PutOk);

        let reply = node
            .dispatch(Message::new(MessageKind::ClientGet, "key1"), "peer-1")
            .await;
        assert_eq!(reply.kind, MessageKind::GetOk);
        assert_eq!(reply.payload, Bytes::from("v1,v2"));

        // locks were released once the write finished
        assert!(node.locks.is_idle().unwrap());
    }

    #[tokio::test]
    async fn get_miss_answers_missing() {
        let node = test_node();

        let reply = node
            .dispatch(Message::new(MessageKind::ClientGet, "nothing"), "peer-1")
            .await;
        assert_eq!(error_reason(&reply), "missing");
    }

    #[tokio::test]
    async fn locked_key_refuses_a_second_writer() {
        let node = test_node();
        node.locks
            .try_acquire(Bytes::from("key1"), "other-writer")
            .unwrap();

        let reply = node
            .dispatch(Message::new(MessageKind::ClientPut, "key1|v1"), "peer-1")
            .await;
        assert_eq!(error_reason(&reply), "locked");

        // the key was never written
        let reply = node
            .dispatch(Message::new(MessageKind::ClientGet, "key1"), "peer-1")
            .await;
        assert_eq!(error_reason(&reply), "missing");
    }

    #[tokio::test]
    async fn failed_batch_releases_the_locks_it_took() {
        let node = test_node();
        node.locks
            .try_acquire(Bytes::from("key2"), "other-writer")
            .unwrap();

        let reply = node
            .dispatch(
                Message::new(MessageKind::ClientPut, "key1|v1;key2|v2"),
                "peer-1",
            )
            .await;
        assert_eq!(error_reason(&reply), "locked");

        // key1's lock was rolled back, only the foreign holder remains
        assert!(node.locks.try_acquire(Bytes::from("key1"), "peer-2").unwrap());
    }

    #[tokio::test]
    async fn replica_put_ignores_locks() {
        let node = test_node();
        node.locks
            .try_acquire(Bytes::from("key1"), "other-writer")
            .unwrap();

        let reply = node
            .dispatch(Message::new(MessageKind::ReplPut, "key1|v9"), "peer-1")
            .await;
        assert_eq!(reply.kind, MessageKind::PutOk);

        assert_eq!(
            node.engine.get(b"key1").await.unwrap().unwrap(),
            Bytes::from("v9")
        );
    }

    #[tokio::test]
    async fn pause_refuses_client_traffic_but_serves_the_manager() {
        let node = test_node();
        node.engine
            .put(Bytes::from("key1"), Bytes::from("v1"))
            .await
            .unwrap();

        let reply = node
            .dispatch(Message::new(MessageKind::PauseNode, ""), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::PauseAck);

        for kind in [
            MessageKind::ClientGet,
            MessageKind::ClientPut,
            MessageKind::ClientDelete,
        ] {
            let reply = node.dispatch(Message::new(kind, "key1|v1"), "peer-1").await;
            assert_eq!(error_reason(&reply), "node paused");
        }

        // manager traffic still flows
        let reply = node
            .dispatch(Message::new(MessageKind::ManagerGet, "key1"), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::GetOk);
        let reply = node
            .dispatch(Message::new(MessageKind::ReplPut, "key2|v2"), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::PutOk);
        let reply = node
            .dispatch(Message::new(MessageKind::GetAllKeys, ""), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::AllKeys);
        let reply = node
            .dispatch(Message::new(MessageKind::AvailabilityCheck, ""), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::AvailableStatus);

        let reply = node
            .dispatch(Message::new(MessageKind::ResumeNode, ""), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::ResumeAck);

        let reply = node
            .dispatch(Message::new(MessageKind::ClientGet, "key1"), "peer-1")
            .await;
        assert_eq!(reply.kind, MessageKind::GetOk);
    }

    #[tokio::test]
    async fn availability_tracks_the_lock_table() {
        let node = test_node();

        let reply = node
            .dispatch(Message::new(MessageKind::AvailabilityCheck, ""), "manager")
            .await;
        assert_eq!(reply.payload, Bytes::from("yes"));

        node.locks
            .try_acquire(Bytes::from("key1"), "writer")
            .unwrap();
        let reply = node
            .dispatch(Message::new(MessageKind::AvailabilityCheck, ""), "manager")
            .await;
        assert_eq!(reply.payload, Bytes::from("no"));
    }

    #[tokio::test]
    async fn manager_get_is_batched_and_ordered() {
        let node = test_node();
        node.engine
            .put(Bytes::from("a"), Bytes::from("1"))
            .await
            .unwrap();
        node.engine
            .put(Bytes::from("b"), Bytes::from("2"))
            .await
            .unwrap();

        let reply = node
            .dispatch(Message::new(MessageKind::ManagerGet, "b;a"), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::GetOk);
        assert_eq!(reply.payload, Bytes::from("2;1"));

        // any missing key fails the whole batch
        let reply = node
            .dispatch(Message::new(MessageKind::ManagerGet, "a;ghost"), "manager")
            .await;
        assert_eq!(error_reason(&reply), "missing");
    }

    #[tokio::test]
    async fn delete_removes_every_requested_key() {
        let node = test_node();
        for key in ["a", "b", "c"] {
            node.engine
                .put(Bytes::from(key), Bytes::from("v"))
                .await
                .unwrap();
        }

        let reply = node
            .dispatch(Message::new(MessageKind::ManagerDelete, "a;c"), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::DeleteOk);

        let remaining = node.engine.keys().await.unwrap();
        assert_eq!(remaining, vec![Bytes::from("b")]);
    }

    #[tokio::test]
    async fn size_bounds_are_enforced() {
        let node = test_node();

        let long_key = "k".repeat(21);
        let reply = node
            .dispatch(
                Message::new(MessageKind::ClientPut, format!("{}|v", long_key)),
                "peer-1",
            )
            .await;
        assert_eq!(error_reason(&reply), "bad key");

        let long_value = "v".repeat(1001);
        let reply = node
            .dispatch(
                Message::new(MessageKind::ClientPut, format!("key1|{}", long_value)),
                "peer-1",
            )
            .await;
        assert_eq!(error_reason(&reply), "bad value");

        let reply = node
            .dispatch(Message::new(MessageKind::ClientPut, "no-separator"), "peer-1")
            .await;
        assert_eq!(error_reason(&reply), "bad format");
    }

    #[tokio::test]
    async fn table_push_installs_the_snapshot() {
        let node = test_node();
        let mut table = RoutingTable::new(3);
        table.insert_physical("test-node", NodeAddress {
            host: "127.0.0.1".to_string(),
            port: 7001,
        });

        let payload = codec::build_table_payload(&table);
        let reply = node
            .dispatch(Message::new(MessageKind::TablePush, payload), "manager")
            .await;
        assert_eq!(reply.kind, MessageKind::HeartbeatAck);

        let snapshot = node.table_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.replication_factor(), 3);
        assert!(snapshot.contains_physical("test-node"));
    }

    #[cfg(not(feature = "strict-replication"))]
    #[tokio::test]
    async fn unreachable_replicas_do_not_fail_the_put() {
        let node = test_node();

        // a table where the other replica points at a dead port
        let table = RoutingTable::from_parts(
            vec![
                crate::ring::VirtualNode {
                    node_id: "test-node".to_string(),
                    address: NodeAddress {
                        host: "127.0.0.1".to_string(),
                        port: 1,
                    },
                    token: 10,
                },
                crate::ring::VirtualNode {
                    node_id: "dead-node".to_string(),
                    address: NodeAddress {
                        host: "127.0.0.1".to_string(),
                        port: 1,
                    },
                    token: 20,
                },
            ],
            2,
        );
        node.install_table(table).unwrap();

        let reply = node
            .dispatch(Message::new(MessageKind::ClientPut, "key1|v1"), "peer-1")
            .await;
        assert_eq!(reply.kind, MessageKind::PutOk);
        assert!(node.locks.is_idle().unwrap());
    }
}
