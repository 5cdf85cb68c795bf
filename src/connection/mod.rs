//! # Connection & Message Queue
//!
//! One link to one peer: typed sends with optional certification, a bounded
//! outbound queue, per-direction translator chains and listener dispatch.
//!
//! ## Lifecycle
//! ```text
//! Negotiating --(both Hello frames)--> Open --close()--> Closing --> Closed
//!      \_______________________________/  \___timeout / garbled / I/O___/
//! ```
//!
//! ## Update Pass
//! Nothing happens on the wire until [`Connection::update`] runs, either from a
//! [`Driver`] thread or from the caller's own loop. One pass:
//! 1. sends `Hello` if it has not gone out yet
//! 2. drains the transport through the inbound translators, acknowledging and
//!    reordering certified frames, and decodes bodies
//! 3. retransmits certified messages whose backoff expired, failing those out
//!    of attempts
//! 4. writes pending acks and queued messages through the outbound translators
//! 5. sends a keep-alive when idle, and checks inactivity and close grace
//!
//! Listener callbacks fire at the end of the pass, outside every lock.

pub mod dedup;
pub mod driver;
pub mod endpoint;
pub mod listener;
pub(crate) mod queue;

pub use driver::{Drivable, Driver};
pub use endpoint::{Endpoint, EndpointId};
pub use listener::{ConnectionListener, ListenerSet};

use crate::config::{ConnectionConfig, PeerConfig, RetryConfig, MAX_PAYLOAD_SIZE};
use crate::core::serialization::{AnyValue, Descriptor, TypeRegistry};
use crate::error::{ProtocolError, Result};
use crate::protocol::frame::{Frame, FrameKind};
use crate::protocol::handshake::{self, TagMap};
use crate::protocol::CHANNEL_DEFAULT;
use crate::translator::{TranslatorChain, TranslatorFactory};
use crate::transport::Transport;
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use dedup::DuplicateWindow;
use queue::{Arrival, OutboundQueue, ReorderBuffer};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

pub use crate::protocol::frame::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` finished or its grace period ran out
    LocalClose,
    RemoteClose,
    /// No inbound traffic within the configured timeout
    Timeout,
    Garbled(String),
    Handshake(String),
    Transport(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LocalClose => write!(f, "closed locally"),
            DisconnectReason::RemoteClose => write!(f, "closed by peer"),
            DisconnectReason::Timeout => write!(f, "timed out"),
            DisconnectReason::Garbled(e) => write!(f, "garbled payload: {e}"),
            DisconnectReason::Handshake(e) => write!(f, "negotiation failed: {e}"),
            DisconnectReason::Transport(e) => write!(f, "transport failed: {e}"),
        }
    }
}

/// Per-send delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub channel: u8,
    pub certified: bool,
    pub origin: Option<u16>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::certified()
    }
}

impl SendOptions {
    /// Acknowledged, retried, and ordered within its channel
    pub fn certified() -> Self {
        Self {
            channel: CHANNEL_DEFAULT,
            certified: true,
            origin: None,
        }
    }

    /// Sent once; may be lost
    pub fn unreliable() -> Self {
        Self {
            certified: false,
            ..Self::certified()
        }
    }

    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_origin(mut self, peer_id: u16) -> Self {
        self.origin = Some(peer_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    pub channel: u8,
    pub certified: bool,
    /// Local type tag of the body
    pub type_tag: u16,
    /// Originating peer; for received messages the sender unless relayed
    pub origin: Option<u16>,
}

/// A decoded inbound message
#[derive(Clone)]
pub struct Envelope {
    pub header: MessageHeader,
    pub descriptor: Arc<Descriptor>,
    pub value: AnyValue,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("header", &self.header)
            .field("type_name", &self.descriptor.type_name)
            .finish()
    }
}

impl Envelope {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }
}

enum Event {
    Connected,
    Received(Envelope),
    Sent(MessageHeader),
    Certified(MessageHeader),
    Failed(MessageHeader, ProtocolError),
    Disconnected(DisconnectReason),
}

struct Status {
    state: ConnectionState,
    hello_sent: bool,
    remote_peer: Option<u16>,
    last_received: Instant,
    last_sent: Instant,
    close_deadline: Option<Instant>,
    reason: Option<DisconnectReason>,
}

struct Inbound {
    chain: TranslatorChain,
    tags: Option<TagMap>,
    reorder: ReorderBuffer,
    duplicates: DuplicateWindow,
    pending_acks: Vec<MessageId>,
}

struct Wire {
    chain: TranslatorChain,
    transport: Box<dyn Transport>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State behind these locks stays consistent between statements.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builds a [`Connection`] over a transport
pub struct ConnectionBuilder {
    registry: Arc<TypeRegistry>,
    peer_id: u16,
    config: ConnectionConfig,
    retry: RetryConfig,
    max_payload: usize,
    translators: Vec<Arc<dyn TranslatorFactory>>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl ConnectionBuilder {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            peer_id: rand::random(),
            config: ConnectionConfig::default(),
            retry: RetryConfig::default(),
            max_payload: MAX_PAYLOAD_SIZE,
            translators: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn peer_id(mut self, peer_id: u16) -> Self {
        self.peer_id = peer_id;
        self
    }

    /// Connection and retry sections of a peer configuration, plus its
    /// payload limit
    pub fn config(mut self, config: &PeerConfig) -> Self {
        self.config = config.connection.clone();
        self.retry = config.retry.clone();
        self.max_payload = config.translator.max_payload_size;
        self
    }

    /// Largest encoded message body [`Connection::send`] accepts
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Append a translator stage; outbound runs stages in the order added
    pub fn translator(mut self, factory: Arc<dyn TranslatorFactory>) -> Self {
        self.translators.push(factory);
        self
    }

    pub fn translators(mut self, factories: Vec<Arc<dyn TranslatorFactory>>) -> Self {
        self.translators.extend(factories);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Freezes the registry and returns the connection in `Negotiating`
    pub fn build<T: Transport + 'static>(self, transport: T) -> Result<Arc<Connection>> {
        let inbound_chain = TranslatorChain::from_factories(&self.translators)?;
        let outbound_chain = TranslatorChain::from_factories(&self.translators)?;
        self.registry.freeze();

        let now = Instant::now();
        let describe = transport.describe();
        let listeners = ListenerSet::new();
        for l in self.listeners {
            listeners.add(l);
        }
        let connection = Arc::new_cyclic(|me| Connection {
            me: me.clone(),
            id: EndpointId::next(),
            local_peer: self.peer_id,
            registry: self.registry,
            queue: Mutex::new(OutboundQueue::new(self.config.queue_capacity)),
            inbound: Mutex::new(Inbound {
                chain: inbound_chain,
                tags: None,
                reorder: ReorderBuffer::new(self.config.duplicate_window),
                duplicates: DuplicateWindow::new(self.config.duplicate_window),
                pending_acks: Vec::new(),
            }),
            wire: Mutex::new(Wire {
                chain: outbound_chain,
                transport: Box::new(transport),
            }),
            status: Mutex::new(Status {
                state: ConnectionState::Negotiating,
                hello_sent: false,
                remote_peer: None,
                last_received: now,
                last_sent: now,
                close_deadline: None,
                reason: None,
            }),
            driving: Mutex::new(()),
            listeners,
            metrics: Metrics::new(),
            config: self.config,
            retry: self.retry,
            max_payload: self.max_payload,
        });
        info!(id = %connection.id, peer_id = connection.local_peer, transport = %describe, "Connection created");
        Ok(connection)
    }
}

/// A link to one peer. Shared as `Arc<Connection>` between the driver and
/// sending threads.
pub struct Connection {
    me: Weak<Connection>,
    id: EndpointId,
    local_peer: u16,
    registry: Arc<TypeRegistry>,
    config: ConnectionConfig,
    retry: RetryConfig,
    max_payload: usize,
    // Lock order: status, queue, inbound, wire.
    status: Mutex<Status>,
    queue: Mutex<OutboundQueue>,
    inbound: Mutex<Inbound>,
    wire: Mutex<Wire>,
    /// Serializes update passes
    driving: Mutex<()>,
    listeners: ListenerSet,
    metrics: Metrics,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.local_peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn builder(registry: Arc<TypeRegistry>) -> ConnectionBuilder {
        ConnectionBuilder::new(registry)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The peer id this side announces
    pub fn peer_id(&self) -> u16 {
        self.local_peer
    }

    /// The peer id the other side announced, once negotiated
    pub fn remote_peer_id(&self) -> Option<u16> {
        lock(&self.status).remote_peer
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.status).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        lock(&self.status).reason.clone()
    }

    /// Owning handle, for callbacks that only hold `&Connection`
    pub fn handle(&self) -> Option<Arc<Connection>> {
        self.me.upgrade()
    }

    /// Messages queued plus certified messages awaiting acknowledgement
    pub fn pending(&self) -> usize {
        lock(&self.queue).pending()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    /// Queue a registered value for delivery.
    ///
    /// Fails with `Conversion` if the value cannot be encoded,
    /// `OversizedPacket` if its body exceeds the payload limit, `QueueFull` if
    /// the pending limit is reached, and `Disconnected` once closing has begun.
    pub fn send<T: Any>(&self, value: &T, options: SendOptions) -> Result<MessageId> {
        self.send_any(value, options)
    }

    pub fn send_any(&self, value: &dyn Any, options: SendOptions) -> Result<MessageId> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(ProtocolError::Disconnected)
            }
            ConnectionState::Negotiating | ConnectionState::Open => {}
        }
        let bytes = self.registry.encode_any(value)?;
        let (tag, body) = TypeRegistry::split_tag(&bytes)?;
        if body.len() > self.max_payload {
            debug!(id = %self.id, size = body.len(), limit = self.max_payload, "Send rejected: payload too large");
            return Err(ProtocolError::OversizedPacket(body.len()));
        }
        let result = lock(&self.queue).enqueue(options, tag, body.to_vec());
        match result {
            Ok(header) => {
                trace!(id = %header.id, channel = header.channel, certified = header.certified, "Message queued");
                Ok(header.id)
            }
            Err(e) => {
                if matches!(e, ProtocolError::QueueFull { .. }) {
                    self.metrics.queue_full();
                    debug!(id = %self.id, error = %e, "Send rejected");
                }
                Err(e)
            }
        }
    }

    /// Begin a graceful close: outstanding certified messages get the close
    /// grace period to be acknowledged, then the link is dropped.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn close(&self) {
        let mut status = lock(&self.status);
        match status.state {
            ConnectionState::Negotiating | ConnectionState::Open => {
                status.state = ConnectionState::Closing;
                status.close_deadline = Some(Instant::now() + self.config.close_grace);
                info!(grace_ms = self.config.close_grace.as_millis() as u64, "Closing");
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// Close immediately; unacknowledged certified messages fail
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn close_now(&self) {
        let _driving = lock(&self.driving);
        if self.is_closed() {
            return;
        }
        let mut events = Vec::new();
        self.finish(DisconnectReason::LocalClose, &mut events);
        self.dispatch(events);
    }

    pub fn update(&self) -> ConnectionState {
        self.update_at(Instant::now())
    }

    /// One update pass at time `now`. Returns the state after the pass.
    pub fn update_at(&self, now: Instant) -> ConnectionState {
        let _driving = lock(&self.driving);
        if self.is_closed() {
            return ConnectionState::Closed;
        }
        let mut events = Vec::new();
        if let Err(reason) = self.step(now, &mut events) {
            self.finish(reason, &mut events);
        }
        self.dispatch(events);
        self.state()
    }

    fn step(&self, now: Instant, events: &mut Vec<Event>) -> std::result::Result<(), DisconnectReason> {
        let hello_needed = !lock(&self.status).hello_sent;
        if hello_needed {
            self.write_frame(&handshake::hello(self.local_peer, &self.registry), now)?;
            lock(&self.status).hello_sent = true;
            debug!(id = %self.id, types = self.registry.len(), "Hello sent");
        }

        self.receive(now, events)?;

        let (state, negotiated) = {
            let status = lock(&self.status);
            (status.state, status.remote_peer.is_some())
        };
        if negotiated && matches!(state, ConnectionState::Open | ConnectionState::Closing) {
            self.retransmit(now, events)?;
            self.flush_acks(now)?;
            self.flush_queue(now, events)?;
        } else {
            self.flush_acks(now)?;
        }

        let (last_sent, last_received, deadline) = {
            let status = lock(&self.status);
            (status.last_sent, status.last_received, status.close_deadline)
        };
        if state == ConnectionState::Open
            && now.saturating_duration_since(last_sent) >= self.config.keepalive_interval
        {
            self.write_frame(&Frame::control(FrameKind::KeepAlive), now)?;
        }
        if now.saturating_duration_since(last_received) > self.config.connection_timeout {
            warn!(id = %self.id, "No traffic within timeout");
            return Err(DisconnectReason::Timeout);
        }
        if state == ConnectionState::Closing {
            let idle = lock(&self.queue).is_idle();
            if idle {
                return Err(DisconnectReason::LocalClose);
            }
            if deadline.is_some_and(|d| now >= d) {
                warn!(id = %self.id, in_flight = lock(&self.queue).in_flight(), "Close grace expired");
                return Err(DisconnectReason::LocalClose);
            }
        }
        Ok(())
    }

    fn receive(&self, now: Instant, events: &mut Vec<Event>) -> std::result::Result<(), DisconnectReason> {
        loop {
            let received = lock(&self.wire).transport.try_recv();
            let payload = match received {
                Ok(Some(payload)) => payload,
                Ok(None) => return Ok(()),
                Err(e) => return Err(DisconnectReason::Transport(e.to_string())),
            };
            self.metrics.bytes_in(payload.len());
            lock(&self.status).last_received = now;

            let plain = lock(&self.inbound)
                .chain
                .inbound(payload)
                .map_err(|e| DisconnectReason::Garbled(e.to_string()))?;
            let frame = Frame::decode(&plain).map_err(|e| DisconnectReason::Garbled(e.to_string()))?;
            trace!(id = %self.id, kind = frame.kind_name(), msg = %frame.id, "Frame received");
            self.handle_frame(frame, events)?;
        }
    }

    fn handle_frame(&self, frame: Frame, events: &mut Vec<Event>) -> std::result::Result<(), DisconnectReason> {
        match frame.kind {
            FrameKind::Hello { peer_id, ref types } => {
                let tags = handshake::negotiate(&self.registry, types)
                    .map_err(|e| DisconnectReason::Handshake(e.to_string()))?;
                let mut status = lock(&self.status);
                if status.remote_peer.is_some() {
                    warn!(id = %self.id, "Repeated hello ignored");
                    return Ok(());
                }
                status.remote_peer = Some(peer_id);
                lock(&self.inbound).tags = Some(tags);
                if status.state == ConnectionState::Negotiating {
                    status.state = ConnectionState::Open;
                    info!(id = %self.id, remote_peer = peer_id, "Connection open");
                    events.push(Event::Connected);
                }
            }
            FrameKind::Ack { ids } => {
                let mut queue = lock(&self.queue);
                for id in ids {
                    if let Some(header) = queue.acknowledge(id) {
                        self.metrics.message_certified();
                        events.push(Event::Certified(header));
                    }
                }
            }
            FrameKind::KeepAlive => {}
            FrameKind::Skip => {
                let mut ready = Vec::new();
                lock(&self.inbound).reorder.skip_to(frame.channel, frame.floor, &mut ready);
                for f in ready {
                    self.deliver(f, events);
                }
            }
            FrameKind::Disconnect => {
                info!(id = %self.id, "Peer disconnected");
                return Err(DisconnectReason::RemoteClose);
            }
            FrameKind::Message { .. } if frame.certified => {
                let msg = frame.id;
                let mut inbound = lock(&self.inbound);
                if inbound.duplicates.contains(msg) {
                    inbound.pending_acks.push(msg);
                    self.metrics.duplicate_dropped();
                    return Ok(());
                }
                let mut ready = Vec::new();
                let arrival = inbound.reorder.accept(frame, &mut ready);
                if arrival != Arrival::Refused {
                    inbound.pending_acks.push(msg);
                    inbound.duplicates.check_and_insert(msg);
                }
                drop(inbound);
                match arrival {
                    Arrival::Delivered => {}
                    Arrival::Held => trace!(id = %self.id, %msg, "Certified frame held for reordering"),
                    Arrival::Stale => self.metrics.duplicate_dropped(),
                    Arrival::Refused => debug!(id = %self.id, %msg, "Reorder buffer full; left unacknowledged"),
                }
                for f in ready {
                    self.deliver(f, events);
                }
            }
            FrameKind::Message { .. } => self.deliver(frame, events),
        }
        Ok(())
    }

    /// Decode a message frame and queue its dispatch. Failures only drop the message.
    fn deliver(&self, frame: Frame, events: &mut Vec<Event>) {
        let FrameKind::Message { tag, body } = frame.kind else {
            return;
        };
        let remote_peer = lock(&self.status).remote_peer;
        let decoded = {
            let inbound = lock(&self.inbound);
            match inbound.tags.as_ref() {
                Some(tags) => tags.local(tag),
                None => Err(ProtocolError::Conversion("message before type negotiation".to_string())),
            }
        }
        .and_then(|local| Ok((local, self.registry.decode_body(local, &body)?)));

        match decoded {
            Ok((local, (descriptor, value))) => {
                self.metrics.message_received();
                events.push(Event::Received(Envelope {
                    header: MessageHeader {
                        id: frame.id,
                        channel: frame.channel,
                        certified: frame.certified,
                        type_tag: local,
                        origin: frame.origin.or(remote_peer),
                    },
                    descriptor,
                    value,
                }));
            }
            Err(e) => {
                self.metrics.conversion_error();
                warn!(id = %self.id, msg = %frame.id, remote_tag = tag, error = %e, "Dropping undecodable message");
            }
        }
    }

    fn retransmit(&self, now: Instant, events: &mut Vec<Event>) -> std::result::Result<(), DisconnectReason> {
        let work = lock(&self.queue).due(now, &self.retry);
        for encoded in work.retransmit {
            self.metrics.retransmit();
            self.write_encoded(encoded, now)?;
        }
        let mut skipped = Vec::new();
        for header in work.failed {
            self.metrics.message_failed();
            warn!(id = %self.id, msg = %header.id, attempts = self.retry.max_attempts, "Certified message failed");
            if !skipped.contains(&header.channel) {
                skipped.push(header.channel);
            }
            events.push(Event::Failed(header, ProtocolError::Timeout));
        }
        for channel in skipped {
            self.send_skip(channel, now)?;
        }
        Ok(())
    }

    /// Let the peer stop waiting for abandoned sequences on `channel`
    fn send_skip(&self, channel: u8, now: Instant) -> std::result::Result<(), DisconnectReason> {
        let floor = lock(&self.queue).floor(channel);
        debug!(id = %self.id, channel, floor, "Skip sent");
        self.write_frame(&Frame::skip(channel, floor), now)
    }

    fn flush_acks(&self, now: Instant) -> std::result::Result<(), DisconnectReason> {
        let ids = std::mem::take(&mut lock(&self.inbound).pending_acks);
        if ids.is_empty() {
            return Ok(());
        }
        trace!(id = %self.id, count = ids.len(), "Acknowledging");
        self.write_frame(&Frame::control(FrameKind::Ack { ids }), now)
    }

    fn flush_queue(&self, now: Instant, events: &mut Vec<Event>) -> std::result::Result<(), DisconnectReason> {
        loop {
            let Some(outgoing) = lock(&self.queue).pop_queued() else {
                return Ok(());
            };
            let encoded = match outgoing.frame.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(id = %self.id, msg = %outgoing.header.id, error = %e, "Frame encoding failed");
                    lock(&self.queue).abandon(&outgoing);
                    if outgoing.header.certified {
                        self.metrics.message_failed();
                        self.send_skip(outgoing.header.channel, now)?;
                        events.push(Event::Failed(outgoing.header, e));
                    }
                    continue;
                }
            };
            if let Err(reason) = self.write_encoded(encoded.clone(), now) {
                lock(&self.queue).requeue_front(outgoing);
                return Err(reason);
            }
            self.metrics.message_sent();
            if outgoing.header.certified {
                lock(&self.queue).track(
                    outgoing.header.clone(),
                    outgoing.frame.sequence,
                    encoded,
                    now,
                    &self.retry,
                );
            }
            events.push(Event::Sent(outgoing.header));
        }
    }

    fn write_frame(&self, frame: &Frame, now: Instant) -> std::result::Result<(), DisconnectReason> {
        let encoded = frame
            .encode()
            .map_err(|e| DisconnectReason::Transport(e.to_string()))?;
        self.write_encoded(encoded, now)
    }

    fn write_encoded(&self, encoded: Vec<u8>, now: Instant) -> std::result::Result<(), DisconnectReason> {
        {
            let mut wire = lock(&self.wire);
            let payload = wire
                .chain
                .outbound(encoded)
                .map_err(|e| DisconnectReason::Transport(e.to_string()))?;
            self.metrics.bytes_out(payload.len());
            wire.transport
                .send(payload)
                .map_err(|e| DisconnectReason::Transport(e.to_string()))?;
        }
        lock(&self.status).last_sent = now;
        Ok(())
    }

    /// Transition to `Closed`, failing every unresolved certified message
    fn finish(&self, reason: DisconnectReason, events: &mut Vec<Event>) {
        {
            let mut status = lock(&self.status);
            if status.state == ConnectionState::Closed {
                return;
            }
            status.state = ConnectionState::Closed;
            status.reason = Some(reason.clone());
        }
        {
            let mut wire = lock(&self.wire);
            if matches!(reason, DisconnectReason::LocalClose | DisconnectReason::Timeout) {
                let goodbye = Frame::control(FrameKind::Disconnect)
                    .encode()
                    .and_then(|f| wire.chain.outbound(f));
                if let Ok(payload) = goodbye {
                    // The link may already be gone; closing proceeds either way.
                    let _ = wire.transport.send(payload);
                }
            }
            wire.transport.close();
        }
        for header in lock(&self.queue).drain_unresolved() {
            self.metrics.message_failed();
            let error = match reason {
                DisconnectReason::Timeout => ProtocolError::ConnectionTimeout,
                _ => ProtocolError::Disconnected,
            };
            events.push(Event::Failed(header, error));
        }
        info!(id = %self.id, %reason, "Connection closed");
        self.metrics.log_metrics(self.local_peer);
        events.push(Event::Disconnected(reason));
    }

    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.snapshot();
        for event in &events {
            for listener in &listeners {
                match event {
                    Event::Connected => listener.connected(self),
                    Event::Received(message) => listener.message_received(self, message),
                    Event::Sent(header) => listener.message_sent(self, header),
                    Event::Certified(header) => listener.message_certified(self, header),
                    Event::Failed(header, error) => listener.message_failed(self, header, error),
                    Event::Disconnected(reason) => listener.disconnected(self, reason),
                }
            }
        }
    }
}

impl Drivable for Connection {
    fn drive(&self) -> bool {
        self.update() != ConnectionState::Closed
    }
}

impl Endpoint for Connection {
    fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        Connection::add_listener(self, listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        Connection::remove_listener(self, listener);
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.handle().into_iter().collect()
    }

    fn broadcast_except(&self, value: &dyn Any, options: SendOptions, except: Option<EndpointId>) -> Result<()> {
        if except == Some(self.id) {
            return Ok(());
        }
        self.send_any(value, options).map(|_| ())
    }
}
