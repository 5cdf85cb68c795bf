//! Round-trip time measurement.
//!
//! A probe carries the sender's clock reading; the peer echoes it back
//! unchanged and the sender subtracts. Probes are unreliable and never
//! retried. A lost probe simply never resolves.

use crate::connection::{Connection, ConnectionListener, Endpoint, Envelope, SendOptions};
use crate::error::Result;
use crate::protocol::message::{Ping, Pong};
use crate::protocol::CHANNEL_PING;
use crate::utils::{Clock, Pending, SystemClock, WaitOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

struct PingInner {
    clock: Arc<dyn Clock>,
    next_probe: AtomicI64,
    probes: Mutex<HashMap<i64, Arc<Pending<Duration>>>>,
}

impl PingInner {
    fn probes(&self) -> MutexGuard<'_, HashMap<i64, Arc<Pending<Duration>>>> {
        self.probes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Answers probes and resolves replies to our own
struct PingResponder {
    inner: Arc<PingInner>,
}

impl ConnectionListener for PingResponder {
    fn message_received(&self, connection: &Connection, message: &Envelope) {
        if let Some(ping) = message.downcast_ref::<Ping>() {
            let pong = Pong {
                probe_id: ping.probe_id,
                sent_at: ping.sent_at,
            };
            if let Err(e) = connection.send(&pong, options()) {
                warn!(connection = %connection.id(), error = %e, "Failed to answer ping");
            }
        } else if let Some(pong) = message.downcast_ref::<Pong>() {
            let Some(pending) = self.inner.probes().remove(&pong.probe_id) else {
                trace!(probe = pong.probe_id, "Pong for unknown probe");
                return;
            };
            let now = self.inner.clock.now_millis();
            let sent = u64::try_from(pong.sent_at).unwrap_or(0);
            let rtt = Duration::from_millis(now.saturating_sub(sent));
            debug!(connection = %connection.id(), rtt_ms = rtt.as_millis() as u64, "Round trip measured");
            pending.resolve(rtt);
        }
    }
}

fn options() -> SendOptions {
    SendOptions::unreliable().on_channel(CHANNEL_PING)
}

#[derive(Clone)]
pub struct PingService {
    inner: Arc<PingInner>,
    responder: Arc<dyn ConnectionListener>,
}

impl std::fmt::Debug for PingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingService")
            .field("outstanding", &self.inner.probes().len())
            .finish()
    }
}

impl Default for PingService {
    fn default() -> Self {
        Self::new()
    }
}

impl PingService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(PingInner {
            clock,
            next_probe: AtomicI64::new(1),
            probes: Mutex::new(HashMap::new()),
        });
        let responder = Arc::new(PingResponder {
            inner: inner.clone(),
        });
        Self { inner, responder }
    }

    /// Answer probes arriving on `endpoint`
    pub fn enable(&self, endpoint: &dyn Endpoint) {
        endpoint.add_listener(self.responder.clone());
    }

    /// Send one probe. The handle resolves when the echo is processed.
    pub fn ping(&self, connection: &Connection) -> Result<PingHandle> {
        connection.add_listener(self.responder.clone());
        let probe_id = self.inner.next_probe.fetch_add(1, Ordering::Relaxed);
        let result = Arc::new(Pending::new());
        self.inner.probes().insert(probe_id, result.clone());

        let ping = Ping {
            probe_id,
            sent_at: i64::try_from(self.inner.clock.now_millis()).unwrap_or(i64::MAX),
        };
        if let Err(e) = connection.send(&ping, options()) {
            self.inner.probes().remove(&probe_id);
            return Err(e);
        }
        trace!(connection = %connection.id(), probe = probe_id, "Ping sent");
        Ok(PingHandle {
            probe_id,
            result,
            owner: Arc::downgrade(&self.inner),
        })
    }

    /// Probe and block for the echo. Someone else must be driving the
    /// connection while this waits.
    pub fn ping_and_wait(&self, connection: &Connection, timeout: Duration) -> Result<Option<Duration>> {
        Ok(self.ping(connection)?.wait(timeout))
    }

    /// Probes sent but not yet answered
    pub fn outstanding(&self) -> usize {
        self.inner.probes().len()
    }
}

/// An in-flight probe. Dropping it forgets the probe.
pub struct PingHandle {
    probe_id: i64,
    result: Arc<Pending<Duration>>,
    owner: Weak<PingInner>,
}

impl std::fmt::Debug for PingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingHandle")
            .field("probe_id", &self.probe_id)
            .field("rtt", &self.result.peek())
            .finish()
    }
}

impl PingHandle {
    pub fn probe_id(&self) -> i64 {
        self.probe_id
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.result.peek()
    }

    pub fn wait(&self, timeout: Duration) -> Option<Duration> {
        match self.result.wait(timeout) {
            WaitOutcome::Resolved(rtt) => Some(rtt),
            WaitOutcome::Pending => None,
        }
    }
}

impl Drop for PingHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.probes().remove(&self.probe_id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::serialization::TypeRegistry;
    use crate::transport::ChannelTransport;
    use crate::utils::ManualClock;

    fn open_pair() -> (Arc<Connection>, Arc<Connection>) {
        let registry = Arc::new(TypeRegistry::new());
        let (ta, tb) = ChannelTransport::pair();
        let a = Connection::builder(registry.clone()).build(ta).unwrap();
        let b = Connection::builder(registry).build(tb).unwrap();
        for _ in 0..2 {
            a.update();
            b.update();
        }
        assert!(a.is_open() && b.is_open());
        (a, b)
    }

    #[test]
    fn test_rtt_follows_the_clock() {
        let (a, b) = open_pair();
        let clock = Arc::new(ManualClock::new(10_000));
        let service = PingService::with_clock(clock.clone());
        PingService::new().enable(b.as_ref());

        let handle = service.ping(&a).unwrap();
        a.update();
        b.update();
        b.update();
        clock.advance(50);
        a.update();
        assert_eq!(handle.rtt(), Some(Duration::from_millis(50)));
        assert_eq!(service.outstanding(), 0);
    }

    #[test]
    fn test_clock_going_backwards_saturates_at_zero() {
        let (a, b) = open_pair();
        let clock = Arc::new(ManualClock::new(10_000));
        let service = PingService::with_clock(clock.clone());
        service.enable(b.as_ref());

        let handle = service.ping(&a).unwrap();
        a.update();
        b.update();
        b.update();
        clock.set(9_000);
        a.update();
        assert_eq!(handle.rtt(), Some(Duration::ZERO));
    }

    #[test]
    fn test_unanswered_probe_stays_pending_and_is_forgotten_on_drop() {
        let (a, _b) = open_pair();
        let service = PingService::new();
        let handle = service.ping(&a).unwrap();
        a.update();
        assert_eq!(handle.wait(Duration::from_millis(5)), None);
        assert_eq!(service.outstanding(), 1);
        drop(handle);
        assert_eq!(service.outstanding(), 0);
    }

    #[test]
    fn test_ping_on_closed_connection_fails() {
        let (a, _b) = open_pair();
        a.close_now();
        let service = PingService::new();
        assert!(service.ping(&a).is_err());
        assert_eq!(service.outstanding(), 0);
    }
}
