//! # Tessera Network
//!
//! The peer-to-peer transport and routing core of the Tessera node. It
//! establishes and maintains long-lived authenticated connections,
//! negotiates a channel (logical network) and a role per connection,
//! organizes peers into a structured topology, and dispatches application
//! messages across it. It handles:
//!
//! - **Packet framing** — a fixed binary header plus an opaque payload,
//!   integrity-checked with a truncated content hash.
//! - **Peer I/O** — two tasks per peer, a bounded priority send queue,
//!   duplicate suppression over a sliding hash window, and RTT tracking.
//! - **Handshake** — a three-stage handler chain (channel negotiation,
//!   identity + session-key authentication, overlay dispatch).
//! - **Topology** — parent/children/uncle/nephew/friend links healed by a
//!   periodic seed/root query exchange.
//! - **Routing** — unicast, multicast-by-role, and three broadcast
//!   flavors, with TTL and per-peer dedup on re-broadcast.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  Application protocols (registered Reactors)    │
//!  └──────────────────────┬──────────────────────────┘
//!                         │ ProtocolHandler
//!  ┌──────────────────────▼──────────────────────────┐
//!  │  NetworkManager / PeerToPeer (per channel)      │
//!  │  • topology tables, query tick, routing         │
//!  └──────┬──────────────────────────────────────────┘
//!         │ dispatch on handshake completion
//!  ┌──────▼──────────────────────────────────────────┐
//!  │  ChannelNegotiator → Authenticator → Dispatcher │
//!  └──────┬──────────────────────────────────────────┘
//!         │ one Peer per connection
//!  ┌──────▼──────────────────────────────────────────┐
//!  │  Transport (TCP listener + dialers)             │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]     | `NetworkConfig` defaults and dev overrides |
//! | [`types`]      | Peer ids, addresses, roles, connection types |
//! | [`packet`]     | Wire header, content hash, framed reader/writer |
//! | [`message`]    | Control-plane payloads, bincode ser/de |
//! | [`queue`]      | Bounded multi-level priority send queue |
//! | [`pool`]       | Sliding-window duplicate-hash set |
//! | [`peer`]       | Connection lifecycle and the two I/O tasks |
//! | [`handler`]    | Handshake pipeline plumbing |
//! | [`negotiator`] | Channel agreement stage |
//! | [`auth`]       | Identity and session-key stage |
//! | [`dispatcher`] | Channel demultiplexing stage |
//! | [`transport`]  | TCP listener, dialers, chain entry |
//! | [`overlay`]    | Per-channel topology and routing |
//! | [`manager`]    | Protocol registry and reactor surface |
//! | `testing`      | In-process loopback peers (dev/test only) |
//! | [`error`]      | Crate-wide error enum |

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod manager;
pub mod message;
pub mod negotiator;
pub mod overlay;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod queue;
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod testing;
pub mod transport;
pub mod types;

pub use {
    config::NetworkConfig,
    error::{NetworkError, Result},
    manager::{NetworkManager, ProtocolHandler, Reactor},
    overlay::PeerToPeer,
    packet::{Packet, PacketDest},
    peer::{Peer, PeerSink},
    transport::{Dialer, Transport},
    types::{BroadcastType, ConnectionType, NetAddress, PeerID, ProtocolInfo, RoleFlag},
};
