//! Key movement during membership changes.
//!
//! Every rebalancing pass follows the same shape: work out which keys have
//! to move (the plan), pause every node the plan touches, wait for each to
//! drain its write locks, execute the transfers batched per `(source, dest)`
//! pair, then resume. Storage-side failures are logged and skipped - partial
//! moves are not rolled back.
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{event, Level};

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::net::{self, MessageKind};
use crate::ring::{codec, NodeAddress, RoutingTable, VirtualNode};

/// Keys moving between nodes, batched per `(source, dest)` pair and per
/// source node for deletes.
#[derive(Debug, Default)]
struct TransferPlan {
    moves: BTreeMap<(String, String), Vec<String>>,
    deletes: BTreeMap<String, Vec<String>>,
    addresses: BTreeMap<String, NodeAddress>,
}

impl TransferPlan {
    fn add_move(&mut self, source: &VirtualNode, dest: &VirtualNode, key: &str) {
        self.addresses
            .insert(source.node_id.clone(), source.address.clone());
        self.addresses
            .insert(dest.node_id.clone(), dest.address.clone());
        self.moves
            .entry((source.node_id.clone(), dest.node_id.clone()))
            .or_default()
            .push(key.to_string());
    }

    fn add_delete(&mut self, node: &VirtualNode, key: &str) {
        self.addresses
            .insert(node.node_id.clone(), node.address.clone());
        self.deletes
            .entry(node.node_id.clone())
            .or_default()
            .push(key.to_string());
    }

    fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.deletes.is_empty()
    }

    /// Every node the plan touches; all of them are paused for the duration
    /// of the transfers.
    fn affected(&self) -> Vec<(String, NodeAddress)> {
        self.addresses
            .iter()
            .map(|(node_id, addr)| (node_id.clone(), addr.clone()))
            .collect()
    }
}

/// Rebalances after a node joined. `ring_after` already contains the
/// joiner's virtual entries.
pub(crate) async fn on_join(ring_after: &RoutingTable, new_id: &str, config: &ManagerConfig) {
    // the keys the joiner may now own live on the per-token successors
    let mut sources: BTreeMap<String, NodeAddress> = BTreeMap::new();
    for token in ring_after.tokens_of(new_id) {
        if let Some(successor) = ring_after.successor_physical(token, Some(new_id)) {
            sources.insert(successor.node_id, successor.address);
        }
    }

    let keys = collect_keys(&sources).await;
    let plan = plan_join(ring_after, new_id, &keys);
    event!(
        Level::INFO,
        "join of {}: {} candidate keys, {} move batches, {} delete batches",
        new_id,
        keys.len(),
        plan.moves.len(),
        plan.deletes.len()
    );
    execute(plan, config).await;
}

/// Rebalances after nodes expired. `ring_before` still carries the failed
/// entries, `ring_after` is the table as it will look once they are removed.
pub(crate) async fn on_failure(
    ring_before: &RoutingTable,
    ring_after: &RoutingTable,
    failed: &BTreeSet<String>,
    config: &ManagerConfig,
) {
    if ring_after.is_empty() {
        event!(Level::WARN, "no nodes remain after failure, nothing to rebalance");
        return;
    }

    // the surviving neighbors of every failed virtual position hold the keys
    // that lost a replica
    let mut sources: BTreeMap<String, NodeAddress> = BTreeMap::new();
    for node_id in failed {
        for token in ring_before.tokens_of(node_id) {
            if let Some(successor) = ring_after.successor_physical(token, None) {
                sources.insert(successor.node_id, successor.address);
            }
            if let Some(predecessor) = ring_after.predecessor_physical(token, None) {
                sources.insert(predecessor.node_id, predecessor.address);
            }
        }
    }

    let keys = collect_keys(&sources).await;
    let plan = plan_failure(ring_before, ring_after, failed, &keys);
    event!(
        Level::INFO,
        "failure of {:?}: {} candidate keys, {} move batches",
        failed,
        keys.len(),
        plan.moves.len()
    );
    execute(plan, config).await;
}

async fn collect_keys(sources: &BTreeMap<String, NodeAddress>) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for (node_id, addr) in sources {
        match fetch_all_keys(addr).await {
            Ok(node_keys) => keys.extend(node_keys),
            Err(err) => event!(Level::WARN, "GET_ALL_KEYS from {} failed: {}", node_id, err),
        }
    }
    keys
}

/// Decides where every candidate key goes after a join: any key whose new
/// preference list includes the joiner is copied to it from its primary (or
/// the primary's successor when the joiner itself became primary), and the
/// physical that fell off the end of the replica set drops its copy.
fn plan_join(ring_after: &RoutingTable, new_id: &str, keys: &BTreeSet<String>) -> TransferPlan {
    let replication_factor = ring_after.replication_factor();
    let mut plan = TransferPlan::default();

    for key in keys {
        let list = ring_after.preference_list(key.as_bytes());
        let Some(position) = list.iter().position(|node| node.node_id == new_id) else {
            continue;
        };
        let joiner = list[position].clone();

        // copy from the primary, or from the primary's successor when the
        // joiner itself became primary (with K = 1 that successor sits
        // outside the preference list)
        let originator = if list[0].node_id != new_id {
            list[0].clone()
        } else {
            match ring_after.successors(key.as_bytes(), 2).into_iter().nth(1) {
                Some(node) => node,
                // the joiner is the only node, nothing to copy from
                None => continue,
            }
        };
        plan.add_move(&originator, &joiner, key);

        // the displaced replica is the next distinct physical after the new
        // replica set - the node that held position K before the join
        let walk = ring_after.successors(key.as_bytes(), replication_factor + 1);
        if walk.len() == replication_factor + 1 {
            plan.add_delete(&walk[replication_factor], key);
        }
    }

    plan
}

/// Decides how every candidate key recovers a lost replica: the first
/// surviving member of the old preference list copies the key to whichever
/// physical entered the list once the failed nodes were removed.
fn plan_failure(
    ring_before: &RoutingTable,
    ring_after: &RoutingTable,
    failed: &BTreeSet<String>,
    keys: &BTreeSet<String>,
) -> TransferPlan {
    let mut plan = TransferPlan::default();

    for key in keys {
        let old_list = ring_before.preference_list(key.as_bytes());
        if !old_list.iter().any(|node| failed.contains(&node.node_id)) {
            continue;
        }

        let Some(originator) = old_list.iter().find(|node| !failed.contains(&node.node_id))
        else {
            event!(Level::WARN, "every replica of key {} was lost", key);
            continue;
        };

        let new_list = ring_after.preference_list(key.as_bytes());
        for dest in new_list
            .iter()
            .filter(|node| !old_list.iter().any(|old| old.node_id == node.node_id))
        {
            plan.add_move(originator, dest, key);
        }
    }

    plan
}

async fn execute(plan: TransferPlan, config: &ManagerConfig) {
    if plan.is_empty() {
        return;
    }

    let affected = plan.affected();
    for (node_id, addr) in &affected {
        if let Err(err) = pause_node(addr).await {
            event!(Level::WARN, "unable to pause {}: {}", node_id, err);
        }
    }
    for (node_id, addr) in &affected {
        if !wait_for_availability(addr, config).await {
            event!(
                Level::WARN,
                "node {} still holds locks after {} checks, proceeding",
                node_id,
                config.availability_attempts
            );
        }
    }

    for ((source, dest), keys) in &plan.moves {
        let (Some(source_addr), Some(dest_addr)) =
            (plan.addresses.get(source), plan.addresses.get(dest))
        else {
            continue;
        };

        match fetch_values(source_addr, keys).await {
            Ok(values) => {
                let pairs: Vec<(String, String)> = keys.iter().cloned().zip(values).collect();
                let payload = codec::build_put_payload(&pairs);
                match push_entries(dest_addr, &payload).await {
                    Ok(()) => event!(
                        Level::INFO,
                        "moved {} keys from {} to {}",
                        keys.len(),
                        source,
                        dest
                    ),
                    Err(err) => {
                        event!(Level::WARN, "transfer {} -> {} failed: {}", source, dest, err)
                    }
                }
            }
            Err(err) => event!(
                Level::WARN,
                "read of {} keys from {} failed, skipping batch: {}",
                keys.len(),
                source,
                err
            ),
        }
    }

    for (node_id, keys) in &plan.deletes {
        let Some(addr) = plan.addresses.get(node_id) else {
            continue;
        };
        if let Err(err) = delete_node_keys(addr, keys).await {
            event!(
                Level::WARN,
                "delete of {} keys from {} failed: {}",
                keys.len(),
                node_id,
                err
            );
        }
    }

    for (node_id, addr) in &affected {
        if let Err(err) = resume_node(addr).await {
            event!(Level::WARN, "unable to resume {}: {}", node_id, err);
        }
    }
}

/// Pushes the table to every physical node; failures are logged, a restarted
/// node re-learns the ring when it registers again.
pub(crate) async fn broadcast_table(table: &RoutingTable) {
    let payload = codec::build_table_payload(table);
    for (node_id, addr) in table.physicals() {
        let result: Result<()> = async {
            let reply = net::round_trip(&addr, MessageKind::TablePush, &payload).await?;
            net::expect_kind(reply, MessageKind::HeartbeatAck)?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            event!(Level::WARN, "table broadcast to {} failed: {}", node_id, err);
        }
    }
}

async fn fetch_all_keys(addr: &NodeAddress) -> Result<Vec<String>> {
    let reply = net::round_trip(addr, MessageKind::GetAllKeys, "").await?;
    let payload = net::expect_kind(reply, MessageKind::AllKeys)?;
    let text = payload_text(&payload)?;
    Ok(text
        .split(',')
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect())
}

async fn fetch_values(addr: &NodeAddress, keys: &[String]) -> Result<Vec<String>> {
    let reply = net::round_trip(addr, MessageKind::ManagerGet, &keys.join(";")).await?;
    let payload = net::expect_kind(reply, MessageKind::GetOk)?;
    let text = payload_text(&payload)?;

    let values: Vec<String> = text.split(';').map(str::to_string).collect();
    if values.len() != keys.len() {
        return Err(Error::BadFormat {
            reason: format!("asked for {} values, got {}", keys.len(), values.len()),
        });
    }
    Ok(values)
}

async fn push_entries(addr: &NodeAddress, payload: &str) -> Result<()> {
    let reply = net::round_trip(addr, MessageKind::ReplPut, payload).await?;
    net::expect_kind(reply, MessageKind::PutOk)?;
    Ok(())
}

async fn delete_node_keys(addr: &NodeAddress, keys: &[String]) -> Result<()> {
    let reply = net::round_trip(addr, MessageKind::ManagerDelete, &keys.join(";")).await?;
    net::expect_kind(reply, MessageKind::DeleteOk)?;
    Ok(())
}

async fn pause_node(addr: &NodeAddress) -> Result<()> {
    let reply = net::round_trip(addr, MessageKind::PauseNode, "").await?;
    net::expect_kind(reply, MessageKind::PauseAck)?;
    Ok(())
}

async fn resume_node(addr: &NodeAddress) -> Result<()> {
    let reply = net::round_trip(addr, MessageKind::ResumeNode, "").await?;
    net::expect_kind(reply, MessageKind::ResumeAck)?;
    Ok(())
}

/// Polls the node until it reports no held locks, bounded by the configured
/// attempts. Returning false means the caller proceeds anyway.
async fn wait_for_availability(addr: &NodeAddress, config: &ManagerConfig) -> bool {
    for _ in 0..config.availability_attempts {
        match net::round_trip(addr, MessageKind::AvailabilityCheck, "").await {
            Ok(reply) => {
                if let Ok(payload) = net::expect_kind(reply, MessageKind::AvailableStatus) {
                    if payload.as_ref() == b"yes" {
                        return true;
                    }
                }
            }
            Err(err) => event!(Level::DEBUG, "availability check failed: {}", err),
        }
        tokio::time::sleep(Duration::from_millis(config.availability_delay_ms)).await;
    }

    false
}

fn payload_text(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec()).map_err(|err| Error::BadFormat {
        reason: format!("payload is not valid utf8: {}", err),
    })
}
