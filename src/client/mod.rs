//! The client API.
//!
//! A client caches the routing table pushed by the manager and, for every
//! operation, walks the key's preference list until a storage node answers.
//! Any failed attempt refreshes the table eagerly - the manager's
//! replication factor is authoritative and rides along with every push. No
//! errors escape to the caller: `get` returns the empty list and `put`
//! returns false once every replica has been tried.
use tracing::{event, Level};

use crate::config::{MAX_KEY_BYTES, MAX_VALUE_BYTES};
use crate::error::{Error, Result};
use crate::net::{self, MessageKind};
use crate::ring::{codec, NodeAddress, RoutingTable, VirtualNode};

pub struct StoreClient {
    client_id: String,
    manager_addr: NodeAddress,
    table: Option<RoutingTable>,
}

impl StoreClient {
    /// Connects to the manager and caches the initial routing table.
    pub async fn init(client_id: impl Into<String>, manager_addr: NodeAddress) -> Self {
        let mut client = Self {
            client_id: client_id.into(),
            manager_addr,
            table: None,
        };

        if !client.refresh_table().await {
            event!(
                Level::WARN,
                "client {} starts without a routing table",
                client.client_id
            );
        }
        client
    }

    /// Re-fetches the routing table from the manager.
    pub async fn refresh_table(&mut self) -> bool {
        let result: Result<RoutingTable> = async {
            let reply =
                net::round_trip(&self.manager_addr, MessageKind::ClientHello, "").await?;
            let payload = net::expect_kind(reply, MessageKind::TablePush)?;
            let text = String::from_utf8(payload.to_vec()).map_err(|err| Error::BadFormat {
                reason: format!("table payload is not valid utf8: {}", err),
            })?;
            codec::parse_table_payload(&text)
        }
        .await;

        match result {
            Ok(table) => {
                event!(
                    Level::DEBUG,
                    "client {} now sees {} nodes at replication {}",
                    self.client_id,
                    table.distinct_physical_count(),
                    table.replication_factor()
                );
                self.table = Some(table);
                true
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    "client {} failed to refresh table: {}",
                    self.client_id,
                    err
                );
                false
            }
        }
    }

    /// The current table snapshot, if any.
    pub fn table(&self) -> Option<&RoutingTable> {
        self.table.as_ref()
    }

    /// Reads a key. Returns the value list of the first replica that
    /// answers, or the empty list once every attempt failed.
    pub async fn get(&mut self, key: &str) -> Vec<String> {
        if let Err(err) = validate_key(key) {
            event!(Level::WARN, "get rejected: {}", err);
            return Vec::new();
        }

        let attempts = self.ensure_attempts().await;
        for attempt in 0..attempts {
            let Some(target) = self.replica_for(key, attempt) else {
                self.refresh_table().await;
                continue;
            };

            match self
                .try_storage(&target, MessageKind::ClientGet, key, MessageKind::GetOk)
                .await
            {
                Ok(payload) => return parse_value_list(&payload),
                Err(err) => {
                    event!(
                        Level::DEBUG,
                        "get attempt {} via {} failed: {}",
                        attempt,
                        target.node_id,
                        err
                    );
                    self.refresh_table().await;
                }
            }
        }

        event!(Level::WARN, "get exhausted every replica for key {}", key);
        Vec::new()
    }

    /// Writes a key. A single acknowledging replica makes the put succeed;
    /// that node is responsible for fanning the write out to the rest of the
    /// replica set.
    pub async fn put(&mut self, key: &str, value: &[String]) -> bool {
        if let Err(err) = validate_key(key) {
            event!(Level::WARN, "put rejected: {}", err);
            return false;
        }
        if let Err(err) = validate_value(value) {
            event!(Level::WARN, "put rejected: {}", err);
            return false;
        }

        let payload = format!("{}|{}", key, value.join(","));
        let attempts = self.ensure_attempts().await;
        for attempt in 0..attempts {
            let Some(target) = self.replica_for(key, attempt) else {
                self.refresh_table().await;
                continue;
            };

            match self
                .try_storage(&target, MessageKind::ClientPut, &payload, MessageKind::PutOk)
                .await
            {
                Ok(_) => {
                    event!(
                        Level::DEBUG,
                        "put for {} acknowledged by {}",
                        key,
                        target.node_id
                    );
                    return true;
                }
                Err(err) => {
                    event!(
                        Level::DEBUG,
                        "put attempt {} via {} failed: {}",
                        attempt,
                        target.node_id,
                        err
                    );
                    self.refresh_table().await;
                }
            }
        }

        event!(Level::WARN, "put exhausted every replica for key {}", key);
        false
    }

    pub fn finalize(&self) {
        event!(Level::INFO, "client {} finalize called", self.client_id);
    }

    async fn try_storage(
        &self,
        target: &VirtualNode,
        kind: MessageKind,
        payload: &str,
        want: MessageKind,
    ) -> Result<String> {
        let reply = net::round_trip(&target.address, kind, payload).await?;
        let payload = net::expect_kind(reply, want)?;
        String::from_utf8(payload.to_vec()).map_err(|err| Error::BadFormat {
            reason: format!("reply payload is not valid utf8: {}", err),
        })
    }

    /// `min(K, distinct nodes)` from the current snapshot, refreshing once
    /// when no usable table is cached.
    async fn ensure_attempts(&mut self) -> usize {
        let attempts = self.max_attempts();
        if attempts > 0 {
            return attempts;
        }
        self.refresh_table().await;
        self.max_attempts()
    }

    fn max_attempts(&self) -> usize {
        self.table
            .as_ref()
            .map(|table| {
                table
                    .replication_factor()
                    .min(table.distinct_physical_count())
            })
            .unwrap_or(0)
    }

    /// The replica contacted on the given attempt, recomputed from the
    /// current snapshot since a refresh may have replaced it.
    fn replica_for(&self, key: &str, attempt: usize) -> Option<VirtualNode> {
        self.table
            .as_ref()?
            .preference_list(key.as_bytes())
            .into_iter()
            .nth(attempt)
    }
}

fn parse_value_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_key(key: &str) -> Result<()> {
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

/// The bound applies to the serialized form, separators included.
fn validate_value(value: &[String]) -> Result<()> {
    let total: usize =
        value.iter().map(String::len).sum::<usize>() + value.len().saturating_sub(1);
    if total > MAX_VALUE_BYTES {
        return Err(Error::BadValue {
            reason: format!("value is {} bytes, max is {}", total, MAX_VALUE_BYTES),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_value_list, validate_key, validate_value, StoreClient};
    use crate::ring::{NodeAddress, RoutingTable};

    fn addr(port: u16) -> NodeAddress {
        NodeAddress {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    fn client_with_table(table: RoutingTable) -> StoreClient {
        StoreClient {
            client_id: "test-client".to_string(),
            manager_addr: addr(0),
            table: Some(table),
        }
    }

    #[test]
    fn replica_walk_matches_the_preference_list() {
        let mut table = RoutingTable::new(2);
        table.insert_physical("node-a", addr(7001));
        table.insert_physical("node-b", addr(7002));
        table.insert_physical("node-c", addr(7003));
        let expected = table.preference_list(b"some-key");

        let client = client_with_table(table);

        assert_eq!(client.replica_for("some-key", 0).unwrap(), expected[0]);
        assert_eq!(client.replica_for("some-key", 1).unwrap(), expected[1]);
        assert!(client.replica_for("some-key", 2).is_none());
    }

    #[test]
    fn attempts_are_capped_by_ring_size_and_replication() {
        let mut table = RoutingTable::new(3);
        table.insert_physical("node-a", addr(7001));
        let client = client_with_table(table);
        assert_eq!(client.max_attempts(), 1);

        let mut table = RoutingTable::new(2);
        for (i, id) in ["node-a", "node-b", "node-c"].iter().enumerate() {
            table.insert_physical(id, addr(7001 + i as u16));
        }
        let client = client_with_table(table);
        assert_eq!(client.max_attempts(), 2);
    }

    #[test]
    fn key_and_value_bounds() {
        assert!(validate_key("key").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(21)).is_err());

        assert!(validate_value(&["v".repeat(1000)]).is_ok());
        assert!(validate_value(&["v".repeat(1001)]).is_err());
        // separators count against the bound
        let many: Vec<String> = (0..501).map(|_| "v".to_string()).collect();
        assert!(validate_value(&many).is_err());
    }

    #[test]
    fn value_lists_are_comma_joined() {
        assert_eq!(parse_value_list("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_value_list("single"), vec!["single"]);
        assert!(parse_value_list("").is_empty());
    }
}
