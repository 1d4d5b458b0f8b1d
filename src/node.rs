//! # Mesh Node Module
//!
//! The protocol engine and its public API.
//!
//! ## Architecture
//!
//! A [`MeshNode`] owns every piece of mesh state: the routing table, the
//! received-message ring, the pending-send queue, the single ACK
//! expectation, and the single in-flight route discovery. The application
//! drives it cooperatively; the engine polls the radio, never the other way
//! around.
//!
//! ## Frame handling
//!
//! Each received frame first feeds the direct-neighbor learning heuristic,
//! then dispatches on its type:
//! - DATA for this node or broadcast is acknowledged (unless broadcast) and
//!   buffered for the application; DATA for someone else is acknowledged
//!   toward its source and forwarded reliably with an incremented hop count.
//! - Route requests are dropped when this node already appears in their
//!   visited list, mined for reverse routes, answered with a route reply at
//!   the destination, and re-broadcast everywhere else.
//! - Route replies are mined for forward routes, complete a matching
//!   discovery at their destination, and are forwarded reliably otherwise.
//! - Route errors are acknowledged, clear the failed route at their
//!   destination, and are forwarded reliably otherwise.
//! - ACKs are matched against the armed expectation and die on the spot.
//!
//! ## Reliable transmission
//!
//! A reliable transmit arms the ACK tracker, puts the frame on the air and
//! polls the radio for up to [`ACK_TIMEOUT`], retransmitting up to
//! [`MAX_ACK_RETRIES`] times. While that wait is in progress the engine is
//! mid-transaction, so frames arriving in the window are handled in a
//! restricted way: ACKs are matched, DATA/RERR still get their immediate
//! hop-ACK and local DATA is buffered, but anything that would need a
//! transmit of its own is parked in a small deferred buffer and dispatched
//! by the next `process` call. This keeps exactly one reliable send in
//! flight without unbounded reentrancy. On exhausted retries the route is
//! cleared, and a forwarder reports a route error back toward the source.

use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::ack_tracker::AckTracker;
use crate::age;
use crate::mesh_frame::{decode_frame, encode_frame, MeshHeader, MessageType, ParsedFrame, MAX_FRAME_LEN};
use crate::message_buffer::{MessageBuffer, ReceivedMessage};
use crate::pending_queue::PendingQueue;
use crate::radio_driver::{RadioDriver, RadioError};
use crate::routing_table::{RoutingEntry, RoutingTable};
use crate::{
    SendError, ACK_TIMEOUT, BROADCAST_ADDRESS, DEFERRED_QUEUE_SIZE, DISCOVERY_TIMEOUT_SECS, MAX_ACK_RETRIES,
    MAX_MESSAGE_LEN, MESSAGE_BUFFER_SIZE, PENDING_EXPIRY_SECS, PENDING_QUEUE_SIZE, RECEIVE_POLL_INTERVAL,
    ROUTE_TIMEOUT_SECS, ROUTING_TABLE_SIZE,
};

/// The single in-flight route discovery.
struct DiscoverySlot {
    destination: u8,
    message_id: u8,
    active: bool,
    age: u16,
}

impl DiscoverySlot {
    const fn idle() -> Self {
        DiscoverySlot {
            destination: 0,
            message_id: 0,
            active: false,
            age: 0,
        }
    }
}

/// A frame captured during an ACK wait, kept for dispatch at the next
/// `process` call.
#[derive(Clone, Copy)]
struct DeferredFrame {
    frame: ParsedFrame,
    ack_sent: bool,
}

enum TransmitError {
    /// Unicast transmit without a valid route to the destination.
    NoRoute,
    /// Header or payload exceeded the frame bounds.
    Encoding,
    Radio(RadioError),
}

/// One mesh node: endpoint, forwarder, and owner of all protocol state.
pub struct MeshNode<RADIO: RadioDriver> {
    radio: RADIO,
    address: u8,
    message_id_counter: u8,
    /// Retransmissions of a single frame after a PHY-level send failure.
    retries: u8,
    /// Sleep between those retransmissions.
    retry_timeout: Duration,
    routing_table: RoutingTable<ROUTING_TABLE_SIZE>,
    message_buffer: MessageBuffer<MESSAGE_BUFFER_SIZE>,
    pending: PendingQueue<PENDING_QUEUE_SIZE>,
    ack_tracker: AckTracker,
    discovery: DiscoverySlot,
    deferred: [Option<DeferredFrame>; DEFERRED_QUEUE_SIZE],
    last_maintenance: Instant,
}

impl<RADIO: RadioDriver> MeshNode<RADIO> {
    pub fn new(radio: RADIO) -> Self {
        MeshNode {
            radio,
            address: 0x00,
            message_id_counter: 0,
            retries: 3,
            retry_timeout: Duration::from_millis(200),
            routing_table: RoutingTable::new(),
            message_buffer: MessageBuffer::new(),
            pending: PendingQueue::new(),
            ack_tracker: AckTracker::new(),
            discovery: DiscoverySlot::idle(),
            deferred: [None; DEFERRED_QUEUE_SIZE],
            last_maintenance: Instant::now(),
        }
    }

    /// Initializes the radio on `frequency` and adopts `address`.
    pub fn begin(&mut self, frequency: u32, address: u8) -> Result<(), RadioError> {
        self.address = address;
        self.radio.begin(frequency)
    }

    pub fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Sets the retransmission count of the unreliable transmit path. Hop
    /// ACK retries are fixed at [`MAX_ACK_RETRIES`].
    pub fn set_retries(&mut self, retries: u8) {
        self.retries = retries;
    }

    /// Sets the sleep between unreliable-path retransmissions.
    pub fn set_retry_timeout(&mut self, timeout_ms: u16) {
        self.retry_timeout = Duration::from_millis(timeout_ms as u64);
    }

    pub fn routing_table(&self) -> &[RoutingEntry] {
        self.routing_table.entries()
    }

    pub fn routing_table_size(&self) -> usize {
        ROUTING_TABLE_SIZE
    }

    /// Writes all live routing entries to the logger at info level.
    pub fn log_routing_table(&self) {
        self.routing_table.log_entries(self.address);
    }

    /// Sends `payload` to `destination` with per-hop reliability, waiting
    /// for route discovery when no route is known yet.
    ///
    /// Blocks cooperatively (polling the engine and sleeping a few
    /// milliseconds at a time) for at most the discovery timeout. Ok means
    /// the frame was acknowledged by the first hop, or — on the discovery
    /// path — that a route appeared and the parked payload was dispatched.
    pub async fn send_to_wait(&mut self, destination: u8, payload: &[u8]) -> Result<(), SendError> {
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(SendError::PayloadTooLarge);
        }
        if destination == self.address {
            return Err(SendError::SelfAddressed);
        }
        if destination == BROADCAST_ADDRESS {
            // Broadcast frames only ever originate from the discovery path.
            return Err(SendError::BroadcastDestination);
        }

        self.run_maintenance();

        if self.routing_table.valid_route(destination).is_some() {
            let message_id = self.next_message_id();
            let mut header = MeshHeader::new(destination, self.address, message_id, MessageType::Data);
            return if self.transmit_reliable(&mut header, payload).await {
                Ok(())
            } else {
                Err(SendError::AckFailed)
            };
        }

        let message_id = self.next_message_id();
        if !self.pending.enqueue(destination, payload, message_id) {
            log!(
                Level::Warn,
                "[{:#04x}] pending queue full, dropping send to {:#04x}",
                self.address,
                destination
            );
            return Err(SendError::QueueFull);
        }
        if !self.start_route_discovery(destination).await {
            return Err(SendError::DiscoveryRefused);
        }

        let deadline = Instant::now() + Duration::from_secs(DISCOVERY_TIMEOUT_SECS as u64);
        while Instant::now() < deadline {
            self.process().await;
            if self.routing_table.valid_route(destination).is_some() {
                // The pending scan inside process() dispatched the payload.
                return Ok(());
            }
            if !self.discovery.active {
                return Err(SendError::DiscoveryFailed);
            }
            Timer::after(RECEIVE_POLL_INTERVAL).await;
        }

        if self.discovery.active && self.discovery.destination == destination {
            self.discovery.active = false;
            self.routing_table.abort_discovery(destination);
        }
        Err(SendError::DiscoveryFailed)
    }

    /// Drains the oldest delivered message into `buf` after advancing the
    /// engine. Returns None when nothing is waiting.
    pub async fn recv_from_ack(&mut self, buf: &mut [u8]) -> Option<ReceivedMessage> {
        self.process().await;
        self.message_buffer.take(buf)
    }

    /// Advances the engine and reports whether a message is waiting.
    pub async fn available(&mut self) -> bool {
        self.process().await;
        self.message_buffer.has_data()
    }

    /// One engine step: maintenance, deferred frames, one radio frame, and
    /// the pending-send scan.
    pub async fn process(&mut self) {
        self.run_maintenance();
        self.flush_deferred().await;
        if let Some(frame) = self.poll_frame() {
            self.observe_frame(&frame);
            self.dispatch_frame(frame, false).await;
        }
        self.process_pending().await;
    }

    fn next_message_id(&mut self) -> u8 {
        let id = self.message_id_counter;
        self.message_id_counter = self.message_id_counter.wrapping_add(1);
        id
    }

    /// Advances all age counters by the wall-clock seconds elapsed since the
    /// last pass, then applies route and discovery expiry.
    fn run_maintenance(&mut self) {
        let elapsed_secs = self.last_maintenance.elapsed().as_secs();
        if elapsed_secs > 0 {
            self.last_maintenance = self.last_maintenance + Duration::from_secs(elapsed_secs);
            let steps = elapsed_secs.min(u16::MAX as u64) as u16;
            self.routing_table.tick(steps);
            self.pending.tick(steps);
            self.message_buffer.tick(steps);
            self.ack_tracker.tick(steps);
            if self.discovery.active {
                self.discovery.age = age::bump(self.discovery.age, steps);
            }
        }

        self.routing_table.expire(ROUTE_TIMEOUT_SECS);
        if self.discovery.active && age::is_expired(self.discovery.age, DISCOVERY_TIMEOUT_SECS) {
            let destination = self.discovery.destination;
            self.discovery.active = false;
            self.routing_table.abort_discovery(destination);
            log!(
                Level::Debug,
                "[{:#04x}] route discovery for {:#04x} timed out",
                self.address,
                destination
            );
        }
    }

    /// Starts (or joins) a route discovery for `destination`.
    ///
    /// Returns true when a discovery for this destination is now
    /// outstanding; false when a different discovery still holds the slot.
    async fn start_route_discovery(&mut self, destination: u8) -> bool {
        if self.discovery.active {
            if age::is_expired(self.discovery.age, DISCOVERY_TIMEOUT_SECS) {
                let stale = self.discovery.destination;
                self.discovery.active = false;
                self.routing_table.abort_discovery(stale);
            } else if self.discovery.destination == destination {
                return true;
            } else {
                log!(
                    Level::Trace,
                    "[{:#04x}] discovery for {:#04x} busy, refusing {:#04x}",
                    self.address,
                    self.discovery.destination,
                    destination
                );
                return false;
            }
        }

        let message_id = self.next_message_id();
        let mut header = MeshHeader::new(destination, self.address, message_id, MessageType::RouteRequest);
        self.discovery = DiscoverySlot {
            destination,
            message_id,
            active: true,
            age: 0,
        };
        self.routing_table.mark_discovering(destination);
        log!(
            Level::Debug,
            "[{:#04x}] starting route discovery for {:#04x}, id {}",
            self.address,
            destination,
            message_id
        );
        if let Err(error) = self.transmit_frame(&mut header, &[]).await {
            self.log_transmit_error("route request", &error);
        }
        true
    }

    /// Reads one frame off the radio, if any. Malformed frames vanish here.
    fn poll_frame(&mut self) -> Option<ParsedFrame> {
        let size = self.radio.parse_packet();
        if size == 0 {
            return None;
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        let limit = size.min(MAX_FRAME_LEN);
        let mut filled = 0;
        while filled < limit && self.radio.available() {
            match self.radio.read() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                None => break,
            }
        }
        let frame = decode_frame(&buf[..filled]);
        if frame.is_none() {
            log!(
                Level::Trace,
                "[{:#04x}] dropping malformed {} byte frame",
                self.address,
                size
            );
        }
        frame
    }

    /// Direct-neighbor learning: a frame one hop old, or one whose next-hop
    /// field names its own source, came straight from its source. This is a
    /// hint, not a correctness property.
    fn observe_frame(&mut self, frame: &ParsedFrame) {
        let header = &frame.header;
        if header.source == self.address {
            return;
        }
        if header.hop_count == 1 || header.source == frame.next_hop {
            self.learn_route(header.source, header.source, 1);
        }
    }

    async fn dispatch_frame(&mut self, frame: ParsedFrame, ack_sent: bool) {
        match MessageType::from_u8(frame.header.message_type) {
            Some(MessageType::Data) => self.handle_data(frame, ack_sent).await,
            Some(MessageType::RouteRequest) => self.handle_route_request(frame).await,
            Some(MessageType::RouteReply) => self.handle_route_reply(frame).await,
            Some(MessageType::RouteError) => self.handle_route_error(frame, ack_sent).await,
            Some(MessageType::Ack) => self.handle_ack(&frame.header),
            None => {
                log!(
                    Level::Trace,
                    "[{:#04x}] ignoring frame with unknown type {:#04x}",
                    self.address,
                    frame.header.message_type
                );
            }
        }
    }

    async fn handle_data(&mut self, frame: ParsedFrame, ack_sent: bool) {
        let header = frame.header;
        if header.destination != BROADCAST_ADDRESS && !ack_sent {
            self.send_ack(header.source, header.message_id).await;
        }

        if header.destination == self.address || header.destination == BROADCAST_ADDRESS {
            log!(
                Level::Debug,
                "[{:#04x}] delivering {} bytes from {:#04x}, id {}",
                self.address,
                frame.payload_len,
                header.source,
                header.message_id
            );
            self.message_buffer.push(&header, frame.payload());
            return;
        }

        let mut forwarded = header;
        forwarded.hop_count = forwarded.hop_count.saturating_add(1);
        log!(
            Level::Debug,
            "[{:#04x}] forwarding data {:#04x} -> {:#04x}, hop {}",
            self.address,
            header.source,
            header.destination,
            forwarded.hop_count
        );
        self.transmit_reliable(&mut forwarded, frame.payload()).await;
    }

    async fn handle_route_request(&mut self, frame: ParsedFrame) {
        let header = frame.header;
        if header.is_visited(self.address) {
            log!(
                Level::Trace,
                "[{:#04x}] dropping looped route request from {:#04x}",
                self.address,
                header.source
            );
            return;
        }

        self.learn_from_request_path(&header);

        if header.destination == self.address {
            let mut reply = MeshHeader::new(header.source, self.address, header.message_id, MessageType::RouteReply);
            reply.visited_nodes = header.visited_nodes;
            reply.visited_count = header.visited_count;
            reply.add_visited_node(self.address);
            log!(
                Level::Debug,
                "[{:#04x}] answering route request from {:#04x}, id {}",
                self.address,
                header.source,
                header.message_id
            );
            if let Err(error) = self.transmit_frame(&mut reply, &[]).await {
                self.log_transmit_error("route reply", &error);
            }
        } else {
            // The transmit path appends this node and bumps the hop count.
            let mut forwarded = header;
            if let Err(error) = self.transmit_frame(&mut forwarded, &[]).await {
                self.log_transmit_error("route request relay", &error);
            }
        }
    }

    async fn handle_route_reply(&mut self, frame: ParsedFrame) {
        let header = frame.header;
        self.learn_from_reply_path(&header);

        if header.destination == self.address {
            if self.discovery.active && self.discovery.message_id == header.message_id {
                self.discovery.active = false;
                log!(
                    Level::Debug,
                    "[{:#04x}] route discovery id {} completed",
                    self.address,
                    header.message_id
                );
            }
        } else if self.routing_table.valid_route(header.destination).is_some() {
            let mut forwarded = header;
            self.transmit_reliable(&mut forwarded, frame.payload()).await;
        }
    }

    async fn handle_route_error(&mut self, frame: ParsedFrame, ack_sent: bool) {
        let header = frame.header;
        if !ack_sent {
            self.send_ack(header.source, header.message_id).await;
        }

        if header.destination == self.address {
            if frame.payload_len > 0 {
                let unreachable = frame.payload[0];
                log!(
                    Level::Debug,
                    "[{:#04x}] route error from {:#04x}: clearing route to {:#04x}",
                    self.address,
                    header.source,
                    unreachable
                );
                self.routing_table.clear(unreachable);
            }
        } else {
            let mut forwarded = header;
            self.transmit_reliable(&mut forwarded, frame.payload()).await;
        }
    }

    fn handle_ack(&mut self, header: &MeshHeader) {
        if self.ack_tracker.on_ack(header.source, header.message_id) {
            log!(
                Level::Trace,
                "[{:#04x}] hop ack from {:#04x}, id {}",
                self.address,
                header.source,
                header.message_id
            );
        }
    }

    /// Reverse-path learning from a route request: everything before this
    /// node in the visited list is reachable through our predecessor.
    fn learn_from_request_path(&mut self, header: &MeshHeader) {
        if header.visited_count == 0 {
            return;
        }
        let position = header.position_of(self.address).unwrap_or(header.visited_count as usize);
        if position > 0 {
            let via = header.visited_nodes[position - 1];
            self.learn_route(header.source, via, position as u8);
            for index in 1..position {
                self.learn_route(header.visited_nodes[index], via, (position - index) as u8);
            }
        } else {
            self.learn_route(header.source, header.source, 1);
        }
    }

    /// Forward-path learning from a route reply: everything after this node
    /// in the visited list is reachable through our successor.
    fn learn_from_reply_path(&mut self, header: &MeshHeader) {
        let count = header.visited_count as usize;
        if count == 0 {
            return;
        }
        let Some(position) = header.position_of(self.address) else {
            return;
        };
        if position + 1 < count {
            let via = header.visited_nodes[position + 1];
            for index in (position + 1)..count {
                self.learn_route(header.visited_nodes[index], via, (index - position) as u8);
            }
            self.learn_route(header.source, via, (count - position) as u8);
        } else {
            self.learn_route(header.source, header.source, 1);
        }
    }

    /// Single point of route learning. Refuses updates that would violate
    /// the table invariant (routes to or through this node itself).
    fn learn_route(&mut self, destination: u8, next_hop: u8, hop_count: u8) {
        if destination == self.address || next_hop == self.address || hop_count == 0 {
            return;
        }
        self.routing_table.update(destination, next_hop, hop_count);
    }

    async fn send_ack(&mut self, destination: u8, message_id: u8) {
        let mut header = MeshHeader::new(destination, self.address, message_id, MessageType::Ack);
        if let Err(error) = self.transmit_frame(&mut header, &[]).await {
            self.log_transmit_error("ack", &error);
        }
    }

    async fn send_route_error(&mut self, toward: u8, unreachable: u8) {
        let message_id = self.next_message_id();
        let mut header = MeshHeader::new(toward, self.address, message_id, MessageType::RouteError);
        let payload = [unreachable];
        log!(
            Level::Debug,
            "[{:#04x}] reporting unreachable {:#04x} toward {:#04x}",
            self.address,
            unreachable,
            toward
        );
        if let Err(error) = self.transmit_frame(&mut header, &payload).await {
            self.log_transmit_error("route error", &error);
        }
    }

    /// Unreliable transmit. Flooded frames (broadcast destination or route
    /// request) get the hop-count increment and this node appended to their
    /// visited list; unicast frames need a valid route for their next hop.
    /// PHY-level failures are retried `retries` times with `retry_timeout`
    /// between attempts.
    async fn transmit_frame(&mut self, header: &mut MeshHeader, payload: &[u8]) -> Result<(), TransmitError> {
        let next_hop = if header.destination == BROADCAST_ADDRESS
            || header.message_type == MessageType::RouteRequest as u8
        {
            header.hop_count = header.hop_count.saturating_add(1);
            header.add_visited_node(self.address);
            BROADCAST_ADDRESS
        } else {
            match self.routing_table.valid_route(header.destination) {
                Some(route) => route.next_hop,
                None => return Err(TransmitError::NoRoute),
            }
        };

        let mut buf = [0u8; MAX_FRAME_LEN];
        let Some(length) = encode_frame(header, next_hop, payload, &mut buf) else {
            return Err(TransmitError::Encoding);
        };

        let mut attempt = 0;
        loop {
            match self.transmit_raw(&buf[..length]) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if attempt >= self.retries {
                        return Err(TransmitError::Radio(error));
                    }
                    attempt += 1;
                    Timer::after(self.retry_timeout).await;
                }
            }
        }
    }

    fn transmit_raw(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        self.radio.begin_packet()?;
        for &byte in bytes {
            self.radio.write(byte);
        }
        self.radio.end_packet()
    }

    /// Reliable transmit: unicast with per-hop acknowledgement. Broadcast,
    /// route-request and ACK frames degenerate to the unreliable path.
    ///
    /// On exhausted retries the route is cleared; a forwarder additionally
    /// reports a route error back toward the frame's source.
    async fn transmit_reliable(&mut self, header: &mut MeshHeader, payload: &[u8]) -> bool {
        if header.destination == BROADCAST_ADDRESS
            || header.message_type == MessageType::RouteRequest as u8
            || header.message_type == MessageType::Ack as u8
        {
            return self.transmit_frame(header, payload).await.is_ok();
        }

        let Some(next_hop) = self.routing_table.valid_route(header.destination).map(|r| r.next_hop) else {
            return false;
        };

        for _ in 0..=MAX_ACK_RETRIES {
            self.ack_tracker.arm(next_hop, header.message_id);
            if let Err(error) = self.transmit_frame(header, payload).await {
                self.log_transmit_error("reliable frame", &error);
                continue;
            }
            if self.wait_for_ack().await {
                self.ack_tracker.disarm();
                return true;
            }
        }
        self.ack_tracker.disarm();

        log!(
            Level::Warn,
            "[{:#04x}] no ack from {:#04x} for id {}, clearing route to {:#04x}",
            self.address,
            next_hop,
            header.message_id,
            header.destination
        );
        if header.source != self.address && header.message_type == MessageType::Data as u8 {
            self.send_route_error(header.source, header.destination).await;
        }
        self.routing_table.clear(header.destination);
        false
    }

    /// Polls the radio until the armed ACK arrives or [`ACK_TIMEOUT`]
    /// passes.
    async fn wait_for_ack(&mut self) -> bool {
        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            if let Some(frame) = self.poll_frame() {
                self.observe_frame(&frame);
                self.capture_frame(frame).await;
            }
            if self.ack_tracker.received() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            Timer::after(RECEIVE_POLL_INTERVAL).await;
        }
    }

    /// Restricted frame handling inside an ACK wait: no second reliable
    /// send may start, so anything that would transmit beyond an immediate
    /// hop-ACK is deferred.
    async fn capture_frame(&mut self, frame: ParsedFrame) {
        let header = frame.header;
        if header.source == self.address {
            return;
        }
        match MessageType::from_u8(header.message_type) {
            Some(MessageType::Ack) => self.handle_ack(&header),
            Some(MessageType::Data) => {
                if header.destination != BROADCAST_ADDRESS {
                    self.send_ack(header.source, header.message_id).await;
                }
                if header.destination == self.address || header.destination == BROADCAST_ADDRESS {
                    self.message_buffer.push(&header, frame.payload());
                } else {
                    self.defer_frame(frame, true);
                }
            }
            Some(MessageType::RouteError) => {
                self.send_ack(header.source, header.message_id).await;
                if header.destination == self.address {
                    if frame.payload_len > 0 {
                        self.routing_table.clear(frame.payload[0]);
                    }
                } else {
                    self.defer_frame(frame, true);
                }
            }
            Some(MessageType::RouteRequest) | Some(MessageType::RouteReply) => {
                self.defer_frame(frame, false);
            }
            None => {}
        }
    }

    fn defer_frame(&mut self, frame: ParsedFrame, ack_sent: bool) {
        let duplicate = self.deferred.iter().flatten().any(|deferred| {
            deferred.frame.header.source == frame.header.source
                && deferred.frame.header.message_id == frame.header.message_id
                && deferred.frame.header.message_type == frame.header.message_type
        });
        if duplicate {
            return;
        }
        for slot in self.deferred.iter_mut() {
            if slot.is_none() {
                *slot = Some(DeferredFrame { frame, ack_sent });
                return;
            }
        }
        log!(
            Level::Warn,
            "[{:#04x}] deferred buffer full, dropping frame from {:#04x}",
            self.address,
            frame.header.source
        );
    }

    async fn flush_deferred(&mut self) {
        for index in 0..DEFERRED_QUEUE_SIZE {
            if let Some(deferred) = self.deferred[index].take() {
                self.dispatch_frame(deferred.frame, deferred.ack_sent).await;
            }
        }
    }

    /// Tries to dispatch every parked payload: sends it once a route exists,
    /// restarts discovery while none does, and abandons it past expiry.
    async fn process_pending(&mut self) {
        for index in 0..PENDING_QUEUE_SIZE {
            let Some(parked) = self.pending.get(index) else {
                continue;
            };
            if age::is_expired(parked.age, PENDING_EXPIRY_SECS) {
                log!(
                    Level::Debug,
                    "[{:#04x}] abandoning pending send to {:#04x}, id {}",
                    self.address,
                    parked.destination,
                    parked.message_id
                );
                self.pending.release(index);
                continue;
            }

            if self.routing_table.valid_route(parked.destination).is_some() {
                let mut header =
                    MeshHeader::new(parked.destination, self.address, parked.message_id, MessageType::Data);
                let delivered = self.transmit_reliable(&mut header, parked.payload()).await;
                self.pending.release(index);
                log!(
                    Level::Debug,
                    "[{:#04x}] pending send to {:#04x}, id {}: {}",
                    self.address,
                    parked.destination,
                    parked.message_id,
                    if delivered { "delivered" } else { "failed" }
                );
            } else if !self.discovery.active
                || (self.discovery.destination != parked.destination
                    && age::is_expired(self.discovery.age, DISCOVERY_TIMEOUT_SECS))
            {
                self.start_route_discovery(parked.destination).await;
            }
        }
    }

    fn log_transmit_error(&self, what: &str, error: &TransmitError) {
        match error {
            TransmitError::NoRoute => {
                log!(Level::Trace, "[{:#04x}] no route for {}", self.address, what);
            }
            TransmitError::Encoding => {
                log!(Level::Warn, "[{:#04x}] {} exceeded frame bounds", self.address, what);
            }
            TransmitError::Radio(_) => {
                log!(Level::Warn, "[{:#04x}] radio failed transmitting {}", self.address, what);
            }
        }
    }
}

#[cfg(all(test, feature = "radio-driver-simulator"))]
mod tests {
    use super::*;
    use crate::radio_driver_simulator::{SimulatedNetwork, SimulatedRadio};
    use crate::{MAX_HOPS, RouteState};
    use futures::executor::block_on;
    use futures::join;

    const FREQUENCY: u32 = 868_000_000;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn node(radio: SimulatedRadio, address: u8) -> MeshNode<SimulatedRadio> {
        let mut node = MeshNode::new(radio);
        node.begin(FREQUENCY, address).unwrap();
        node
    }

    fn frame_bytes(header: &MeshHeader, next_hop: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let length = encode_frame(header, next_hop, payload, &mut buf).unwrap();
        buf[..length].to_vec()
    }

    fn spy_frames(net: &SimulatedNetwork, spy_id: usize) -> Vec<ParsedFrame> {
        let mut frames = Vec::new();
        while let Some(bytes) = net.pop_inbox(spy_id) {
            if let Some(frame) = decode_frame(&bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    async fn drive_for(node: &mut MeshNode<SimulatedRadio>, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            node.process().await;
            Timer::after(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn send_rejects_invalid_input() {
        init_logging();
        let net = SimulatedNetwork::new(1);
        let mut a = node(net.join(), 0x01);

        let oversized = [0u8; MAX_MESSAGE_LEN + 1];
        assert_eq!(block_on(a.send_to_wait(0x02, &oversized)), Err(SendError::PayloadTooLarge));
        assert_eq!(block_on(a.send_to_wait(0x01, b"self")), Err(SendError::SelfAddressed));
        assert_eq!(
            block_on(a.send_to_wait(BROADCAST_ADDRESS, b"all")),
            Err(SendError::BroadcastDestination)
        );
    }

    #[test]
    fn delivers_and_acks_direct_data() {
        init_logging();
        let net = SimulatedNetwork::new(2);
        let radio_a = net.join();
        let spy = net.join();
        net.link(&radio_a, &spy);
        let spy_id = spy.node_id();
        let mut a = node(radio_a, 0x01);

        let mut header = MeshHeader::new(0x01, 0x05, 9, MessageType::Data);
        header.hop_count = 1;
        net.inject(a.radio.node_id(), &frame_bytes(&header, 0x01, b"ping"));

        let mut buf = [0u8; 8];
        let message = block_on(a.recv_from_ack(&mut buf)).unwrap();
        assert_eq!(&buf[..message.length], b"ping");
        assert_eq!(message.source, 0x05);
        assert_eq!(message.destination, 0x01);
        assert_eq!(message.message_id, 9);

        // The one-hop frame taught us a direct route, which carried the ack.
        let route = a.routing_table.valid_route(0x05).unwrap();
        assert_eq!(route.next_hop, 0x05);
        assert_eq!(route.hop_count, 1);

        let acks = spy_frames(&net, spy_id);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].header.message_type, MessageType::Ack as u8);
        assert_eq!(acks[0].header.destination, 0x05);
        assert_eq!(acks[0].header.source, 0x01);
        assert_eq!(acks[0].header.message_id, 9);
    }

    #[test]
    fn route_request_learns_reverse_path_and_replies_at_destination() {
        init_logging();
        let net = SimulatedNetwork::new(3);
        let radio_a = net.join();
        let spy = net.join();
        net.link(&radio_a, &spy);
        let spy_id = spy.node_id();
        let mut a = node(radio_a, 0x01);

        let mut request = MeshHeader::new(0x01, 0x03, 21, MessageType::RouteRequest);
        request.hop_count = 2;
        request.add_visited_node(0x03);
        request.add_visited_node(0x02);
        net.inject(a.radio.node_id(), &frame_bytes(&request, BROADCAST_ADDRESS, &[]));

        block_on(a.process());

        let to_source = a.routing_table.valid_route(0x03).unwrap();
        assert_eq!(to_source.next_hop, 0x02);
        assert_eq!(to_source.hop_count, 2);
        let to_relay = a.routing_table.valid_route(0x02).unwrap();
        assert_eq!(to_relay.next_hop, 0x02);
        assert_eq!(to_relay.hop_count, 1);

        let frames = spy_frames(&net, spy_id);
        assert_eq!(frames.len(), 1);
        let reply = &frames[0];
        assert_eq!(reply.header.message_type, MessageType::RouteReply as u8);
        assert_eq!(reply.header.destination, 0x03);
        assert_eq!(reply.header.source, 0x01);
        assert_eq!(reply.header.message_id, 21);
        assert_eq!(reply.header.visited(), &[0x03, 0x02, 0x01]);
        assert_eq!(reply.next_hop, 0x02);
    }

    #[test]
    fn route_request_is_rebroadcast_with_one_hop_increment() {
        init_logging();
        let net = SimulatedNetwork::new(4);
        let radio_b = net.join();
        let spy = net.join();
        net.link(&radio_b, &spy);
        let spy_id = spy.node_id();
        let mut b = node(radio_b, 0x02);

        let mut request = MeshHeader::new(0x09, 0x03, 5, MessageType::RouteRequest);
        request.hop_count = 1;
        request.add_visited_node(0x03);
        net.inject(b.radio.node_id(), &frame_bytes(&request, BROADCAST_ADDRESS, &[]));

        block_on(b.process());

        let frames = spy_frames(&net, spy_id);
        assert_eq!(frames.len(), 1);
        let relayed = &frames[0];
        assert_eq!(relayed.header.message_type, MessageType::RouteRequest as u8);
        assert_eq!(relayed.header.hop_count, 2);
        assert_eq!(relayed.header.visited(), &[0x03, 0x02]);
        assert_eq!(relayed.next_hop, BROADCAST_ADDRESS);
    }

    #[test]
    fn looped_route_request_is_dropped() {
        init_logging();
        let net = SimulatedNetwork::new(5);
        let radio_b = net.join();
        let spy = net.join();
        net.link(&radio_b, &spy);
        let spy_id = spy.node_id();
        let mut b = node(radio_b, 0x02);

        let mut request = MeshHeader::new(0x09, 0x03, 5, MessageType::RouteRequest);
        request.hop_count = 3;
        request.add_visited_node(0x03);
        request.add_visited_node(0x02);
        request.add_visited_node(0x04);
        net.inject(b.radio.node_id(), &frame_bytes(&request, BROADCAST_ADDRESS, &[]));

        block_on(b.process());

        assert!(spy_frames(&net, spy_id).is_empty());
        assert_eq!(b.routing_table.live_count(), 0);
    }

    #[test]
    fn route_reply_completes_discovery_and_learns_forward_path() {
        init_logging();
        let net = SimulatedNetwork::new(6);
        let mut a = node(net.join(), 0x01);

        assert!(block_on(a.start_route_discovery(0x03)));
        let discovery_id = a.discovery.message_id;
        assert_eq!(
            a.routing_table.find(0x03).unwrap().state,
            RouteState::Discovering
        );

        let mut reply = MeshHeader::new(0x01, 0x03, discovery_id, MessageType::RouteReply);
        reply.add_visited_node(0x01);
        reply.add_visited_node(0x02);
        reply.add_visited_node(0x03);
        net.inject(a.radio.node_id(), &frame_bytes(&reply, 0x01, &[]));

        block_on(a.process());

        assert!(!a.discovery.active);
        let route = a.routing_table.valid_route(0x03).unwrap();
        assert_eq!(route.next_hop, 0x02);
        let relay = a.routing_table.valid_route(0x02).unwrap();
        assert_eq!(relay.next_hop, 0x02);
        assert_eq!(relay.hop_count, 1);
    }

    #[test]
    fn second_discovery_joins_same_destination_and_refuses_another() {
        init_logging();
        let net = SimulatedNetwork::new(7);
        let mut a = node(net.join(), 0x01);

        assert!(block_on(a.start_route_discovery(0x09)));
        let first_id = a.discovery.message_id;

        assert!(block_on(a.start_route_discovery(0x09)));
        assert_eq!(a.discovery.message_id, first_id);
        assert_eq!(a.discovery.destination, 0x09);

        assert!(!block_on(a.start_route_discovery(0x08)));
        assert_eq!(a.discovery.destination, 0x09);

        // An aged-out discovery releases the slot.
        a.discovery.age = DISCOVERY_TIMEOUT_SECS;
        assert!(block_on(a.start_route_discovery(0x08)));
        assert_eq!(a.discovery.destination, 0x08);
        assert!(a.routing_table.find(0x09).is_none());
    }

    #[test]
    fn route_error_clears_named_route() {
        init_logging();
        let net = SimulatedNetwork::new(8);
        let radio_a = net.join();
        let spy = net.join();
        net.link(&radio_a, &spy);
        let spy_id = spy.node_id();
        let mut a = node(radio_a, 0x01);
        a.routing_table.update(0x02, 0x02, 1);
        a.routing_table.update(0x07, 0x02, 2);

        let error = MeshHeader::new(0x01, 0x02, 33, MessageType::RouteError);
        net.inject(a.radio.node_id(), &frame_bytes(&error, 0x01, &[0x07]));

        block_on(a.process());

        assert!(a.routing_table.valid_route(0x07).is_none());
        let frames = spy_frames(&net, spy_id);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.message_type, MessageType::Ack as u8);
        assert_eq!(frames[0].header.message_id, 33);
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        init_logging();
        let net = SimulatedNetwork::new(9);
        let radio_a = net.join();
        let spy = net.join();
        net.link(&radio_a, &spy);
        let spy_id = spy.node_id();
        let mut a = node(radio_a, 0x01);

        let mut header = MeshHeader::new(0x01, 0x05, 1, MessageType::Data);
        header.message_type = 0x77;
        net.inject(a.radio.node_id(), &frame_bytes(&header, 0x01, b"???"));

        assert!(!block_on(a.available()));
        assert!(spy_frames(&net, spy_id).is_empty());
    }

    #[test]
    fn frame_at_hop_limit_is_forwarded_once_then_dropped() {
        init_logging();
        let net = SimulatedNetwork::new(10);
        let radio_b = net.join();
        let spy = net.join();
        net.link(&radio_b, &spy);
        let spy_id = spy.node_id();
        let mut b = node(radio_b, 0x02);
        b.routing_table.update(0x09, 0x08, 1);
        b.routing_table.update(0x03, 0x03, 1);

        let mut header = MeshHeader::new(0x09, 0x03, 17, MessageType::Data);
        header.hop_count = MAX_HOPS as u8;
        let b_radio_id = b.radio.node_id();
        net.inject(b_radio_id, &frame_bytes(&header, 0x02, b"edge"));

        let net_for_ack = net.clone();
        block_on(async {
            join!(b.process(), async {
                // Answer the forwarded frame so the reliable send completes.
                Timer::after(Duration::from_millis(50)).await;
                let ack = MeshHeader::new(0x02, 0x08, 17, MessageType::Ack);
                net_for_ack.inject(b_radio_id, &frame_bytes(&ack, 0x02, &[]));
            })
        });

        let frames = spy_frames(&net, spy_id);
        let forwarded: Vec<_> = frames
            .iter()
            .filter(|f| f.header.message_type == MessageType::Data as u8)
            .collect();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].header.hop_count, MAX_HOPS as u8 + 1);

        // The same frame one hop later fails to even parse and is dropped
        // without any transmission.
        let mut over_limit = MeshHeader::new(0x09, 0x03, 18, MessageType::Data);
        over_limit.hop_count = MAX_HOPS as u8 + 1;
        net.inject(b_radio_id, &frame_bytes(&over_limit, 0x02, b"late"));
        block_on(b.process());
        assert!(spy_frames(&net, spy_id).is_empty());
    }

    #[test]
    fn discovery_and_delivery_across_three_nodes() {
        init_logging();
        let net = SimulatedNetwork::new(11);
        let radio_a = net.join();
        let radio_b = net.join();
        let radio_c = net.join();
        net.link(&radio_a, &radio_b);
        net.link(&radio_b, &radio_c);

        let mut a = node(radio_a, 0x01);
        let mut b = node(radio_b, 0x02);
        let mut c = node(radio_c, 0x03);

        let (sent, _, _) = block_on(async {
            join!(
                a.send_to_wait(0x03, b"hi"),
                drive_for(&mut b, Duration::from_secs(4)),
                drive_for(&mut c, Duration::from_secs(4)),
            )
        });
        assert_eq!(sent, Ok(()));

        let route = a.routing_table.valid_route(0x03).unwrap();
        assert_eq!(route.next_hop, 0x02);

        let mut buf = [0u8; 8];
        let delivered = block_on(c.recv_from_ack(&mut buf)).unwrap();
        assert_eq!(&buf[..delivered.length], b"hi");
        assert_eq!(delivered.source, 0x01);
        assert_eq!(delivered.destination, 0x03);

        // Table invariants hold on every node after the exchange.
        for mesh in [&a, &b, &c] {
            for entry in mesh.routing_table.entries() {
                if entry.state == RouteState::Valid {
                    assert!(entry.hop_count >= 1);
                    assert_ne!(entry.next_hop, mesh.address);
                }
            }
        }
    }

    #[test]
    fn unacknowledged_send_clears_the_route() {
        init_logging();
        let net = SimulatedNetwork::new(12);
        let radio_a = net.join();
        let radio_b = net.join();
        net.link(&radio_a, &radio_b);
        net.set_powered(radio_b.node_id(), false);

        let mut a = node(radio_a, 0x01);
        a.routing_table.update(0x03, 0x02, 2);

        let result = block_on(a.send_to_wait(0x03, b"void"));
        assert_eq!(result, Err(SendError::AckFailed));
        assert!(a.routing_table.valid_route(0x03).is_none());
    }

    #[test]
    fn forwarder_reports_route_error_toward_source() {
        init_logging();
        let net = SimulatedNetwork::new(13);
        let radio_a = net.join();
        let radio_b = net.join();
        let radio_c = net.join();
        net.link(&radio_a, &radio_b);
        net.link(&radio_b, &radio_c);
        net.set_powered(radio_c.node_id(), false);

        let mut a = node(radio_a, 0x01);
        let mut b = node(radio_b, 0x02);
        a.routing_table.update(0x02, 0x02, 1);
        a.routing_table.update(0x03, 0x02, 2);
        b.routing_table.update(0x01, 0x01, 1);
        b.routing_table.update(0x03, 0x03, 1);

        let (sent, _) = block_on(async {
            join!(a.send_to_wait(0x03, b"doomed"), drive_for(&mut b, Duration::from_secs(3)))
        });
        // The first hop acknowledged, so the send itself succeeded.
        assert_eq!(sent, Ok(()));
        assert!(b.routing_table.valid_route(0x03).is_none());

        // The route error is waiting in A's inbox.
        block_on(drive_for(&mut a, Duration::from_millis(100)));
        assert!(a.routing_table.valid_route(0x03).is_none());
    }

    #[test]
    fn failed_discovery_keeps_pending_entry_until_expiry() {
        init_logging();
        let net = SimulatedNetwork::new(14);
        let mut a = node(net.join(), 0x01);

        let result = block_on(a.send_to_wait(0x63, b"nowhere"));
        assert_eq!(result, Err(SendError::DiscoveryFailed));
        assert!(!a.discovery.active);
        assert_eq!(a.pending.len(), 1);
        assert!(a.routing_table.valid_route(0x63).is_none());

        // Once the entry outlives three discovery timeouts the scan drops it.
        a.pending.tick(PENDING_EXPIRY_SECS);
        block_on(a.process());
        assert_eq!(a.pending.len(), 0);
    }

    #[test]
    fn maximum_length_payload_is_delivered() {
        init_logging();
        let net = SimulatedNetwork::new(15);
        let radio_a = net.join();
        let radio_b = net.join();
        net.link(&radio_a, &radio_b);

        let mut a = node(radio_a, 0x01);
        let mut b = node(radio_b, 0x02);
        a.routing_table.update(0x02, 0x02, 1);
        b.routing_table.update(0x01, 0x01, 1);

        let payload = [0x5A; MAX_MESSAGE_LEN];
        let (sent, _) = block_on(async {
            join!(a.send_to_wait(0x02, &payload), drive_for(&mut b, Duration::from_millis(300)))
        });
        assert_eq!(sent, Ok(()));

        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let delivered = block_on(b.recv_from_ack(&mut buf)).unwrap();
        assert_eq!(delivered.length, MAX_MESSAGE_LEN);
        assert_eq!(buf[..], payload[..]);
        assert_eq!(delivered.source, 0x01);
    }
}
