#![cfg_attr(not(feature = "std"), no_std)]

//! On-demand source-routed mesh networking over a half-duplex LoRa link.
//!
//! Every node carries an 8-bit address and acts both as an endpoint and as a
//! forwarder for its neighbors. Routes are discovered reactively with
//! flooded route requests, learned from the traversed-node lists of passing
//! frames, aged out when unused, and repaired through route-error frames.
//! Unicast delivery is made reliable hop by hop with acknowledgements and
//! bounded retransmission.
//!
//! The engine is single-threaded and cooperative: all state lives in one
//! [`MeshNode`] that the application polls. The radio is accessed through
//! the byte-oriented [`RadioDriver`] trait and is never touched from
//! interrupt context. Nothing is allocated at runtime; every buffer is sized
//! by the selected capacity profile at compile time.

#[cfg(all(feature = "profile-constrained", feature = "profile-high-capacity"))]
compile_error!("Only one capacity profile feature can be enabled at a time");

use embassy_time::Duration;

mod ack_tracker;
mod age;
pub mod mesh_frame;
mod message_buffer;
mod node;
mod pending_queue;
pub mod radio_driver;
mod routing_table;

#[cfg(feature = "radio-driver-simulator")]
pub mod radio_driver_simulator;

pub use mesh_frame::{decode_frame, encode_frame, MeshHeader, MessageType, ParsedFrame, MAX_FRAME_LEN};
pub use message_buffer::ReceivedMessage;
pub use node::MeshNode;
pub use radio_driver::{RadioDriver, RadioError};
pub use routing_table::{RouteState, RoutingEntry};

#[cfg(feature = "radio-driver-simulator")]
pub use radio_driver_simulator::{SimulatedNetwork, SimulatedRadio};

/// Reserved broadcast address. 0x00 remains a valid (if default) node
/// address.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Largest payload a single frame can carry.
pub const MAX_MESSAGE_LEN: usize = 251;

// Capacity profile: default.
#[cfg(not(any(feature = "profile-constrained", feature = "profile-high-capacity")))]
mod profile {
    pub const ROUTING_TABLE_SIZE: usize = 10;
    pub const MAX_HOPS: usize = 10;
    pub const MESSAGE_BUFFER_SIZE: usize = 4;
    pub const PENDING_QUEUE_SIZE: usize = 2;
}

// Capacity profile: memory-constrained nodes.
#[cfg(feature = "profile-constrained")]
mod profile {
    pub const ROUTING_TABLE_SIZE: usize = 5;
    pub const MAX_HOPS: usize = 6;
    pub const MESSAGE_BUFFER_SIZE: usize = 2;
    pub const PENDING_QUEUE_SIZE: usize = 1;
}

// Capacity profile: high-capacity relays.
#[cfg(feature = "profile-high-capacity")]
mod profile {
    pub const ROUTING_TABLE_SIZE: usize = 15;
    pub const MAX_HOPS: usize = 12;
    pub const MESSAGE_BUFFER_SIZE: usize = 8;
    pub const PENDING_QUEUE_SIZE: usize = 5;
}

/// Number of routing-table slots.
pub const ROUTING_TABLE_SIZE: usize = profile::ROUTING_TABLE_SIZE;

/// Upper bound on hop count and on the visited-node list of a frame.
pub const MAX_HOPS: usize = profile::MAX_HOPS;

/// Number of received-message slots the application can lag behind by.
pub const MESSAGE_BUFFER_SIZE: usize = profile::MESSAGE_BUFFER_SIZE;

/// Number of outgoing payloads that can wait on route discovery.
pub const PENDING_QUEUE_SIZE: usize = profile::PENDING_QUEUE_SIZE;

/// Seconds a valid route survives without reconfirmation.
pub const ROUTE_TIMEOUT_SECS: u16 = 30;

/// Seconds a route discovery may stay outstanding.
pub const DISCOVERY_TIMEOUT_SECS: u16 = 5;

/// Seconds a pending payload survives failed discoveries.
pub const PENDING_EXPIRY_SECS: u16 = 3 * DISCOVERY_TIMEOUT_SECS;

/// How long one reliable-transmit attempt waits for its hop ACK.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(300);

/// Retransmissions after the first reliable-transmit attempt.
pub const MAX_ACK_RETRIES: u8 = 3;

/// Sleep between radio polls inside the discovery and ACK wait loops.
pub(crate) const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Frames captured for later dispatch while an ACK wait is in progress.
pub(crate) const DEFERRED_QUEUE_SIZE: usize = 2;

/// Reasons a send can fail.
///
/// All failures are local: the engine keeps running, routes in other
/// directions stay intact, and a later send may succeed again.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum SendError {
    /// Payload exceeds [`MAX_MESSAGE_LEN`].
    PayloadTooLarge,
    /// Destination equals the local address.
    SelfAddressed,
    /// Broadcast DATA is not part of the public send path.
    BroadcastDestination,
    /// The pending queue is full; the payload was dropped.
    QueueFull,
    /// A discovery for a different destination is already in flight.
    DiscoveryRefused,
    /// Route discovery timed out or was cleared without producing a route.
    DiscoveryFailed,
    /// Every retransmission went unacknowledged; the route was cleared.
    AckFailed,
}

#[cfg(feature = "std")]
impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::PayloadTooLarge => write!(f, "payload exceeds the maximum message length"),
            SendError::SelfAddressed => write!(f, "destination is the local address"),
            SendError::BroadcastDestination => write!(f, "broadcast is not a valid unicast destination"),
            SendError::QueueFull => write!(f, "pending queue is full"),
            SendError::DiscoveryRefused => write!(f, "another route discovery is in flight"),
            SendError::DiscoveryFailed => write!(f, "route discovery failed"),
            SendError::AckFailed => write!(f, "no acknowledgement from the next hop"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SendError {}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn capacity_profile_is_consistent() {
        assert!(MAX_HOPS >= 1);
        assert!(ROUTING_TABLE_SIZE >= PENDING_QUEUE_SIZE);
        assert_eq!(PENDING_EXPIRY_SECS, 3 * DISCOVERY_TIMEOUT_SECS);
        assert_eq!(MAX_MESSAGE_LEN, 251);
    }

    #[test]
    fn send_error_messages_are_distinct() {
        let errors = [
            SendError::PayloadTooLarge,
            SendError::SelfAddressed,
            SendError::BroadcastDestination,
            SendError::QueueFull,
            SendError::DiscoveryRefused,
            SendError::DiscoveryFailed,
            SendError::AckFailed,
        ];
        for (i, a) in errors.iter().enumerate() {
            for b in errors.iter().skip(i + 1) {
                assert_ne!(a.to_string(), b.to_string());
            }
        }
    }
}
