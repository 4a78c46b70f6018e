//! # driftshare-engine
//!
//! Runtime logic for driftshare, embedded into the CLI.
//!
//! This crate provides:
//! - **Server**: binds a listener, advertises the service and answers file
//!   list, file and ping requests from a shared [`catalog::Catalog`]
//! - **Client**: per-request connections to peers with bounded waits
//! - **Discovery scanner**: periodic scans, bounded concurrent service
//!   probes and a TTL-based [`registry::PeerRegistry`]
//! - **Transport implementations**: TCP connections and mDNS discovery
//! - **Event bus**: emits peer, transfer and log events consumed by CLI
//!   printers

pub mod catalog;
pub mod client;
pub mod config;
pub mod discovery;
pub mod events;
pub mod mdns;
pub mod message_processor;
pub mod registry;
pub mod server;
pub mod session;
pub mod tcp;

#[cfg(test)]
mod testing;
