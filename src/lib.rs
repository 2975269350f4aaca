//! GTStore is a distributed, replicated in-memory key-value store arranged as
//! a consistent-hash ring with virtual nodes. A single manager process owns
//! ring membership: it accepts storage registrations, watches heartbeats and
//! rebalances keys when nodes join or fail. Storage nodes hold the data,
//! replicate client writes along the ring and answer the manager's bulk
//! traffic during rebalancing. Clients cache the routing table and walk a
//! key's preference list until a replica answers.
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod net;
pub mod ring;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
extern crate quickcheck;

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
