//! # driftshare-core
//!
//! Shared building blocks for the driftshare peer-to-peer file sharing
//! protocol.
//!
//! This crate provides the foundational types used by [`driftshare-engine`]
//! and the `driftshare` binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives**: frame format (4-byte big-endian length +
//!   JSON payload), the message enum, file descriptors, and the service
//!   identifier peers advertise.
//!
//! - **Error taxonomy**: framing violations ([`error::ProtocolError`]) and
//!   every failure the runtime surfaces to callers ([`error::ShareError`]).
//!
//! - **Transport abstractions**: connections, listeners, connectors and
//!   service discovery, so the engine runs over any reliable byte-stream
//!   transport.

pub mod error;
pub mod protocol;
pub mod transport;
