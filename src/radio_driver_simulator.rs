//! # Radio Driver Simulator - Testing and Development Mock
//!
//! In-memory radio network for exercising the mesh engine without hardware.
//! Every joined radio gets an inbox of whole frames; a transmission is
//! delivered to the inbox of every linked, powered-on peer, mimicking the
//! broadcast nature of the LoRa medium (frames are overheard regardless of
//! their next-hop field, exactly as on the air).
//!
//! ## Facilities
//!
//! - **Topology**: explicit symmetric links between node pairs, so tests can
//!   build lines, triangles and partitions.
//! - **Power switch**: a powered-off node neither receives nor transmits,
//!   for dead-neighbor and link-failure scenarios.
//! - **Loss model**: an optional uniform frame-drop probability driven by a
//!   seeded `WyRand`, for retransmission tests.
//! - **Injection**: tests can place an arbitrary raw frame directly into a
//!   node's inbox to exercise single-node protocol behavior.
//!
//! Inboxes queue frames without bound, which deliberately makes multi-node
//! test timing forgiving: a frame transmitted while the receiver was busy is
//! picked up at its next poll.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::radio_driver::{RadioDriver, RadioError};

struct SimulatedNode {
    inbox: VecDeque<Vec<u8>>,
    powered: bool,
}

struct NetworkState {
    nodes: Vec<SimulatedNode>,
    links: Vec<(usize, usize)>,
    rng: WyRand,
    /// Probability, in percent, that a delivery is dropped.
    loss_percent: u8,
}

impl NetworkState {
    fn linked(&self, a: usize, b: usize) -> bool {
        self.links.iter().any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

/// Shared simulated radio medium.
#[derive(Clone)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new(rng_seed: u64) -> Self {
        SimulatedNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                nodes: Vec::new(),
                links: Vec::new(),
                rng: WyRand::seed_from_u64(rng_seed),
                loss_percent: 0,
            })),
        }
    }

    /// Adds a radio to the network and returns its driver handle.
    pub fn join(&self) -> SimulatedRadio {
        let mut state = self.state.lock().unwrap();
        state.nodes.push(SimulatedNode {
            inbox: VecDeque::new(),
            powered: true,
        });
        SimulatedRadio {
            node_id: state.nodes.len() - 1,
            state: Arc::clone(&self.state),
            tx_buffer: Vec::new(),
            tx_open: false,
            rx_frame: Vec::new(),
            rx_position: 0,
        }
    }

    /// Creates a symmetric link between two radios.
    pub fn link(&self, a: &SimulatedRadio, b: &SimulatedRadio) {
        let mut state = self.state.lock().unwrap();
        if !state.linked(a.node_id, b.node_id) {
            state.links.push((a.node_id, b.node_id));
        }
    }

    /// Powers a node on or off. A powered-off node is silent and deaf.
    pub fn set_powered(&self, node_id: usize, powered: bool) {
        self.state.lock().unwrap().nodes[node_id].powered = powered;
    }

    /// Sets the uniform frame-loss probability in percent.
    pub fn set_loss_percent(&self, percent: u8) {
        self.state.lock().unwrap().loss_percent = percent.min(100);
    }

    /// Places a raw frame directly into a node's inbox.
    pub fn inject(&self, node_id: usize, frame: &[u8]) {
        self.state.lock().unwrap().nodes[node_id].inbox.push_back(frame.to_vec());
    }

    /// Takes the oldest undelivered frame from a node's inbox, bypassing the
    /// driver. Lets tests observe traffic with a bare spy radio.
    pub fn pop_inbox(&self, node_id: usize) -> Option<Vec<u8>> {
        self.state.lock().unwrap().nodes[node_id].inbox.pop_front()
    }

    /// Number of frames queued at a node.
    pub fn inbox_len(&self, node_id: usize) -> usize {
        self.state.lock().unwrap().nodes[node_id].inbox.len()
    }
}

/// Driver handle of one simulated radio.
pub struct SimulatedRadio {
    node_id: usize,
    state: Arc<Mutex<NetworkState>>,
    tx_buffer: Vec<u8>,
    tx_open: bool,
    rx_frame: Vec<u8>,
    rx_position: usize,
}

impl SimulatedRadio {
    /// Identifier used by the `SimulatedNetwork` control calls.
    pub fn node_id(&self) -> usize {
        self.node_id
    }
}

impl RadioDriver for SimulatedRadio {
    fn begin(&mut self, _frequency: u32) -> Result<(), RadioError> {
        Ok(())
    }

    fn begin_packet(&mut self) -> Result<(), RadioError> {
        self.tx_buffer.clear();
        self.tx_open = true;
        Ok(())
    }

    fn write(&mut self, byte: u8) {
        if self.tx_open {
            self.tx_buffer.push(byte);
        }
    }

    fn end_packet(&mut self) -> Result<(), RadioError> {
        if !self.tx_open {
            return Err(RadioError::TransmissionFailed);
        }
        self.tx_open = false;

        let mut state = self.state.lock().unwrap();
        if !state.nodes[self.node_id].powered {
            return Err(RadioError::TransmissionFailed);
        }
        for peer in 0..state.nodes.len() {
            if peer == self.node_id || !state.linked(self.node_id, peer) || !state.nodes[peer].powered {
                continue;
            }
            if state.loss_percent > 0 {
                let roll = (state.rng.next_u32() % 100) as u8;
                if roll < state.loss_percent {
                    continue;
                }
            }
            let frame = self.tx_buffer.clone();
            state.nodes[peer].inbox.push_back(frame);
        }
        Ok(())
    }

    fn parse_packet(&mut self) -> usize {
        self.rx_frame.clear();
        self.rx_position = 0;

        let mut state = self.state.lock().unwrap();
        if !state.nodes[self.node_id].powered {
            return 0;
        }
        match state.nodes[self.node_id].inbox.pop_front() {
            Some(frame) => {
                self.rx_frame = frame;
                self.rx_frame.len()
            }
            None => 0,
        }
    }

    fn available(&self) -> bool {
        self.rx_position < self.rx_frame.len()
    }

    fn read(&mut self) -> Option<u8> {
        if self.rx_position < self.rx_frame.len() {
            let byte = self.rx_frame[self.rx_position];
            self.rx_position += 1;
            Some(byte)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(radio: &mut SimulatedRadio) -> Option<Vec<u8>> {
        let size = radio.parse_packet();
        if size == 0 {
            return None;
        }
        let mut frame = Vec::with_capacity(size);
        while radio.available() {
            frame.push(radio.read().unwrap());
        }
        Some(frame)
    }

    #[test]
    fn delivers_only_to_linked_peers() {
        let net = SimulatedNetwork::new(1);
        let mut a = net.join();
        let mut b = net.join();
        let mut c = net.join();
        net.link(&a, &b);

        a.begin_packet().unwrap();
        for &byte in &[1, 2, 3] {
            a.write(byte);
        }
        a.end_packet().unwrap();

        assert_eq!(drain(&mut b).unwrap(), vec![1, 2, 3]);
        assert!(drain(&mut c).is_none());
    }

    #[test]
    fn powered_off_node_is_silent_and_deaf() {
        let net = SimulatedNetwork::new(1);
        let mut a = net.join();
        let mut b = net.join();
        net.link(&a, &b);

        net.set_powered(b.node_id(), false);
        a.begin_packet().unwrap();
        a.write(7);
        a.end_packet().unwrap();
        assert!(drain(&mut b).is_none());

        assert!(b.begin_packet().is_ok());
        b.write(8);
        assert_eq!(b.end_packet(), Err(RadioError::TransmissionFailed));
        assert!(drain(&mut a).is_none());
    }

    #[test]
    fn parse_packet_discards_unread_remainder() {
        let net = SimulatedNetwork::new(1);
        let mut a = net.join();
        net.inject(a.node_id(), &[1, 2, 3]);
        net.inject(a.node_id(), &[4, 5]);

        assert_eq!(a.parse_packet(), 3);
        assert_eq!(a.read(), Some(1));
        // Second frame replaces the half-read first one.
        assert_eq!(a.parse_packet(), 2);
        assert_eq!(a.read(), Some(4));
        assert_eq!(a.read(), Some(5));
        assert!(!a.available());
        assert_eq!(a.read(), None);
    }

    #[test]
    fn full_loss_drops_every_frame() {
        let net = SimulatedNetwork::new(1);
        let mut a = net.join();
        let mut b = net.join();
        net.link(&a, &b);
        net.set_loss_percent(100);

        a.begin_packet().unwrap();
        a.write(9);
        a.end_packet().unwrap();
        assert!(drain(&mut b).is_none());
    }
}
