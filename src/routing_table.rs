//! # Routing Table Module
//!
//! Fixed-size table of per-destination routes with age-based replacement.
//!
//! Each entry records the neighbor to hand a frame to (`next_hop`), the
//! distance in hops, and a saturating age in seconds since the route was
//! last learned. Slot allocation prefers an existing entry for the
//! destination, then any invalid slot, and finally evicts the entry with the
//! largest age. Routes are learned opportunistically from traversed-node
//! lists and direct receptions; they expire after `ROUTE_TIMEOUT_SECS`
//! without reconfirmation.

use log::{log, Level};

use crate::age;

/// Lifecycle state of a routing entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RouteState {
    /// Slot is free; all other fields are meaningless.
    Invalid,
    /// A route request for this destination is in flight.
    Discovering,
    /// The route is usable for unicast transmission.
    Valid,
}

/// One slot of the routing table.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RoutingEntry {
    pub destination: u8,
    /// Neighbor to transmit to. For a valid route this is never the local
    /// address, and `hop_count` is at least 1.
    pub next_hop: u8,
    pub hop_count: u8,
    pub state: RouteState,
    /// Seconds since the route was last learned or confirmed, saturating.
    pub last_seen_age: u16,
}

impl RoutingEntry {
    const fn empty() -> Self {
        RoutingEntry {
            destination: 0,
            next_hop: 0,
            hop_count: 0,
            state: RouteState::Invalid,
            last_seen_age: 0,
        }
    }
}

pub(crate) struct RoutingTable<const TABLE_SIZE: usize> {
    entries: [RoutingEntry; TABLE_SIZE],
}

impl<const TABLE_SIZE: usize> RoutingTable<TABLE_SIZE> {
    pub(crate) const fn new() -> Self {
        RoutingTable {
            entries: [RoutingEntry::empty(); TABLE_SIZE],
        }
    }

    pub(crate) fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    /// Finds the entry for `destination` in any non-invalid state.
    pub(crate) fn find(&self, destination: u8) -> Option<&RoutingEntry> {
        self.entries
            .iter()
            .find(|e| e.destination == destination && e.state != RouteState::Invalid)
    }

    fn find_mut(&mut self, destination: u8) -> Option<&mut RoutingEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.destination == destination && e.state != RouteState::Invalid)
    }

    /// Returns the entry for `destination` only when it is usable.
    pub(crate) fn valid_route(&self, destination: u8) -> Option<&RoutingEntry> {
        self.find(destination).filter(|e| e.state == RouteState::Valid)
    }

    /// Picks the slot for a new destination: first invalid slot, otherwise
    /// the entry with the largest age.
    fn allocate(&mut self) -> &mut RoutingEntry {
        let mut slot = 0;
        let mut oldest_age = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.state == RouteState::Invalid {
                slot = i;
                break;
            }
            if entry.last_seen_age >= oldest_age {
                oldest_age = entry.last_seen_age;
                slot = i;
            }
        }
        &mut self.entries[slot]
    }

    /// Installs or refreshes the route to `destination`, marking it valid
    /// with a fresh age.
    pub(crate) fn update(&mut self, destination: u8, next_hop: u8, hop_count: u8) {
        let entry = match self.find_mut(destination) {
            Some(entry) => entry,
            None => self.allocate(),
        };
        entry.destination = destination;
        entry.next_hop = next_hop;
        entry.hop_count = hop_count;
        entry.state = RouteState::Valid;
        entry.last_seen_age = 0;
    }

    /// Reserves a slot in `Discovering` state for an outstanding route
    /// request. Existing entries keep their next hop; if the table is full
    /// of live routes the discovery simply runs without a reserved slot.
    pub(crate) fn mark_discovering(&mut self, destination: u8) {
        if let Some(entry) = self.find_mut(destination) {
            entry.state = RouteState::Discovering;
            entry.last_seen_age = 0;
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.state == RouteState::Invalid) {
            entry.destination = destination;
            entry.next_hop = destination;
            entry.hop_count = 0;
            entry.state = RouteState::Discovering;
            entry.last_seen_age = 0;
        }
    }

    /// Drops the route to `destination`, if any.
    pub(crate) fn clear(&mut self, destination: u8) {
        if let Some(entry) = self.find_mut(destination) {
            entry.state = RouteState::Invalid;
        }
    }

    /// Downgrades a still-discovering entry back to invalid after its
    /// discovery failed.
    pub(crate) fn abort_discovery(&mut self, destination: u8) {
        if let Some(entry) = self.find_mut(destination) {
            if entry.state == RouteState::Discovering {
                entry.state = RouteState::Invalid;
            }
        }
    }

    /// Advances the age of every live entry by `steps` seconds.
    pub(crate) fn tick(&mut self, steps: u16) {
        for entry in self.entries.iter_mut() {
            if entry.state != RouteState::Invalid {
                entry.last_seen_age = age::bump(entry.last_seen_age, steps);
            }
        }
    }

    /// Invalidates valid routes that have gone unconfirmed for
    /// `timeout_secs`.
    pub(crate) fn expire(&mut self, timeout_secs: u16) {
        for entry in self.entries.iter_mut() {
            if entry.state == RouteState::Valid && age::is_expired(entry.last_seen_age, timeout_secs) {
                entry.state = RouteState::Invalid;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.state != RouteState::Invalid).count()
    }

    /// Dumps all live entries through the logger.
    pub(crate) fn log_entries(&self, own_address: u8) {
        log!(Level::Info, "[{:#04x}] === routing table ===", own_address);
        for entry in self.entries.iter() {
            if entry.state == RouteState::Invalid {
                continue;
            }
            let state = match entry.state {
                RouteState::Discovering => "DISCOVERING",
                RouteState::Valid => "VALID",
                RouteState::Invalid => "INVALID",
            };
            log!(
                Level::Info,
                "[{:#04x}] dest: {:#04x} next: {:#04x} hops: {} age: {}s state: {}",
                own_address,
                entry.destination,
                entry.next_hop,
                entry.hop_count,
                entry.last_seen_age,
                state
            );
        }
        log!(Level::Info, "[{:#04x}] =====================", own_address);
    }
}
