//! Text codecs for the payloads that carry ring and key data.
//!
//! Grammars:
//! - table: `K "#" row (";" row)*` where row = `node_id "," host "," port "," token`
//! - registration: `node_id "," host "," port`
//! - put batch: `key "|" value (";" key "|" value)*`
//! - key lists: keys joined by `;` (requests) or `,` (`ALL_KEYS` replies)
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::ring::{NodeAddress, RoutingTable, VirtualNode};

pub fn build_table_payload(table: &RoutingTable) -> String {
    let rows: Vec<String> = table
        .entries()
        .iter()
        .map(|entry| {
            format!(
                "{},{},{},{}",
                entry.node_id, entry.address.host, entry.address.port, entry.token
            )
        })
        .collect();

    format!("{}#{}", table.replication_factor(), rows.join(";"))
}

pub fn parse_table_payload(payload: &str) -> Result<RoutingTable> {
    let (prefix, rows) = payload.split_once('#').ok_or_else(|| Error::BadFormat {
        reason: "table payload without replication prefix".to_string(),
    })?;

    let replication_factor: usize = prefix.trim().parse().map_err(|_| Error::BadFormat {
        reason: format!("invalid replication factor: {}", prefix),
    })?;

    let mut entries = Vec::new();
    for row in rows.split(';') {
        if row.is_empty() {
            continue;
        }

        let cols: Vec<&str> = row.split(',').collect();
        if cols.len() != 4 {
            return Err(Error::BadFormat {
                reason: format!("table row with {} columns: {}", cols.len(), row),
            });
        }

        let port: u16 = cols[2].trim().parse().map_err(|_| Error::BadFormat {
            reason: format!("invalid port: {}", cols[2]),
        })?;
        let token: u64 = cols[3].trim().parse().map_err(|_| Error::BadFormat {
            reason: format!("invalid token: {}", cols[3]),
        })?;

        entries.push(VirtualNode {
            node_id: cols[0].trim().to_string(),
            address: NodeAddress {
                host: cols[1].trim().to_string(),
                port,
            },
            token,
        });
    }

    Ok(RoutingTable::from_parts(entries, replication_factor))
}

pub fn build_register_payload(node_id: &str, address: &NodeAddress) -> String {
    format!("{},{},{}", node_id, address.host, address.port)
}

pub fn parse_register_payload(payload: &str) -> Result<(String, NodeAddress)> {
    let cols: Vec<&str> = payload.split(',').collect();
    if cols.len() != 3 {
        return Err(Error::BadFormat {
            reason: format!("registration payload with {} columns", cols.len()),
        });
    }

    let port: u16 = cols[2].trim().parse().map_err(|_| Error::BadFormat {
        reason: format!("invalid port: {}", cols[2]),
    })?;

    Ok((
        cols[0].trim().to_string(),
        NodeAddress {
            host: cols[1].trim().to_string(),
            port,
        },
    ))
}

pub fn build_put_payload(pairs: &[(String, String)]) -> String {
    let items: Vec<String> = pairs
        .iter()
        .map(|(key, value)| format!("{}|{}", key, value))
        .collect();
    items.join(";")
}

pub fn parse_put_payload(payload: &str) -> Result<Vec<(Bytes, Bytes)>> {
    let mut pairs = Vec::new();
    for item in payload.split(';') {
        if item.is_empty() {
            continue;
        }

        let (key, value) = item.split_once('|').ok_or_else(|| Error::BadFormat {
            reason: format!("put item without separator: {}", item),
        })?;
        pairs.push((
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
    }

    if pairs.is_empty() {
        return Err(Error::BadFormat {
            reason: "empty put payload".to_string(),
        });
    }

    Ok(pairs)
}

/// Splits a `;`-joined key list, dropping empty items.
pub fn split_keys(payload: &str) -> Vec<Bytes> {
    payload
        .split(';')
        .filter(|key| !key.is_empty())
        .map(|key| Bytes::copy_from_slice(key.as_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        build_put_payload, build_register_payload, build_table_payload, parse_put_payload,
        parse_register_payload, parse_table_payload, split_keys,
    };
    use crate::ring::{NodeAddress, RoutingTable};
    use quickcheck::Arbitrary;
    use rand::{distributions::Alphanumeric, Rng};

    fn addr(port: u16) -> NodeAddress {
        NodeAddress {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn table_payload_round_trip_fixed() {
        let mut table = RoutingTable::new(2);
        table.insert_physical("node-a", addr(7001));
        table.insert_physical("node-b", addr(7002));

        let payload = build_table_payload(&table);
        let parsed = parse_table_payload(&payload).unwrap();

        assert_eq!(parsed.replication_factor(), table.replication_factor());
        assert_eq!(parsed.entries(), table.entries());
    }

    #[test]
    fn empty_table_round_trip() {
        let table = RoutingTable::new(3);
        let payload = build_table_payload(&table);
        let parsed = parse_table_payload(&payload).unwrap();

        assert_eq!(parsed.replication_factor(), 3);
        assert!(parsed.is_empty());
    }

    #[derive(Debug, Clone)]
    struct TableInput {
        ids: Vec<String>,
        replication_factor: usize,
    }

    impl Arbitrary for TableInput {
        fn arbitrary(_: &mut quickcheck::Gen) -> Self {
            let n_nodes = rand::thread_rng().gen_range(0..8);
            let mut ids: Vec<String> = (0..n_nodes)
                .map(|_| {
                    let size = rand::thread_rng().gen_range(4..16);
                    rand::thread_rng()
                        .sample_iter(&Alphanumeric)
                        .take(size)
                        .map(char::from)
                        .collect()
                })
                .collect();
            ids.sort();
            ids.dedup();

            Self {
                ids,
                replication_factor: rand::thread_rng().gen_range(1..5),
            }
        }
    }

    #[quickcheck]
    fn table_payload_round_trip_randomized(input: TableInput) {
        let mut table = RoutingTable::new(input.replication_factor);
        for (i, id) in input.ids.iter().enumerate() {
            table.insert_physical(id, addr(7000 + i as u16));
        }

        let parsed = parse_table_payload(&build_table_payload(&table)).unwrap();

        assert_eq!(parsed.replication_factor(), table.replication_factor());
        assert_eq!(parsed.entries(), table.entries());
    }

    #[test]
    fn malformed_table_payloads_are_rejected() {
        assert!(parse_table_payload("no separator").is_err());
        assert!(parse_table_payload("x#a,b,c,d").is_err());
        assert!(parse_table_payload("2#a,b,c").is_err());
        assert!(parse_table_payload("2#a,h,70000,1").is_err());
        assert!(parse_table_payload("2#a,h,7001,notatoken").is_err());
    }

    #[test]
    fn register_payload_round_trip() {
        let payload = build_register_payload("node-a", &addr(7001));
        let (node_id, address) = parse_register_payload(&payload).unwrap();

        assert_eq!(node_id, "node-a");
        assert_eq!(address, addr(7001));

        assert!(parse_register_payload("only,two").is_err());
        assert!(parse_register_payload("a,h,notaport").is_err());
    }

    #[test]
    fn put_payload_round_trip() {
        let pairs = vec![
            ("key1".to_string(), "v1,v2".to_string()),
            ("key2".to_string(), "v3".to_string()),
        ];

        let payload = build_put_payload(&pairs);
        assert_eq!(payload, "key1|v1,v2;key2|v3");

        let parsed = parse_put_payload(&payload).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "key1");
        assert_eq!(parsed[0].1, "v1,v2");
        assert_eq!(parsed[1].0, "key2");
        assert_eq!(parsed[1].1, "v3");
    }

    #[test]
    fn put_payload_rejects_bad_items() {
        assert!(parse_put_payload("").is_err());
        assert!(parse_put_payload("no-separator").is_err());

        // a value may be empty, a separator-less trailing item may not
        assert!(parse_put_payload("key|").is_ok());
        assert!(parse_put_payload("key|v;junk").is_err());
    }

    #[test]
    fn key_lists_drop_empty_items() {
        let keys = split_keys("a;b;;c;");
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(split_keys("").is_empty());
    }
}
