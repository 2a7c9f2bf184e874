//! The reply matcher registry.
//!
//! Every outgoing request registers a matcher describing the reply it
//! expects: the packet kind, the sender it must come from and either a
//! reply-token to compare or a neighbor count to accumulate. A single
//! dispatcher task owns the matcher list and serializes additions, inbound
//! replies and deadline expiry; callers interact with it only through
//! channels and an opaque [`PendingReply`] handle.

use crate::{
    config::Clock,
    error::RequestError,
    metrics::{CLOCK_DRIFT_SUSPECTED, METRICS},
    wire::{self, Packet},
};
use enr::NodeId;
use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, warn};

/// Continuous timeouts after which to suspect clock drift.
const NTP_FAILURE_THRESHOLD: u32 = 32;

/// Minimum amount of time to pass before repeating the clock drift warning.
const NTP_WARNING_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// How a matcher judges arriving replies.
#[derive(Debug, Clone)]
pub(crate) enum ReplyMatch {
    /// A pong referencing the hash of the ping we sent.
    PongOf([u8; 32]),
    /// Neighbors packets, accumulated until `max` entries have arrived.
    /// Remote ends send these in chunks, so any number of packets may feed
    /// one matcher.
    NeighborsUpTo(usize),
    /// An ENR response referencing the hash of the request we sent.
    EnrResponseOf([u8; 32]),
}

impl ReplyMatch {
    fn packet_kind(&self) -> u8 {
        match self {
            ReplyMatch::PongOf(_) => wire::PONG_PACKET,
            ReplyMatch::NeighborsUpTo(_) => wire::NEIGHBORS_PACKET,
            ReplyMatch::EnrResponseOf(_) => wire::ENR_RESPONSE_PACKET,
        }
    }
}

/// A successfully matched reply.
#[derive(Debug)]
pub(crate) enum Reply {
    Pong(wire::Pong),
    Neighbors(Vec<wire::Node>),
    EnrResponse(wire::EnrResponse),
}

/// The caller's side of a registered matcher. Resolves exactly once.
pub(crate) struct PendingReply {
    rx: oneshot::Receiver<Result<Reply, RequestError>>,
}

impl PendingReply {
    /// A handle that resolves immediately, for requests that failed before
    /// they could be sent.
    pub fn failed(err: RequestError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        PendingReply { rx }
    }

    pub async fn resolve(self) -> Result<Reply, RequestError> {
        self.rx.await.unwrap_or(Err(RequestError::Closed))
    }
}

struct Matcher {
    from: NodeId,
    ip: IpAddr,
    port: u16,
    expect: ReplyMatch,
    deadline: Instant,
    collected: Vec<wire::Node>,
    received: usize,
    reply: Option<Packet>,
    tx: oneshot::Sender<Result<Reply, RequestError>>,
}

impl Matcher {
    /// Feeds a reply already known to come from the right endpoint and be
    /// of the right kind. Returns (matched, request done).
    fn feed(&mut self, packet: &Packet) -> (bool, bool) {
        match (&self.expect, packet) {
            (ReplyMatch::PongOf(hash), Packet::Pong(pong)) => {
                if pong.reply_tok.as_slice() == hash {
                    self.reply = Some(packet.clone());
                    (true, true)
                } else {
                    (false, false)
                }
            }
            (ReplyMatch::NeighborsUpTo(max), Packet::Neighbors(neighbors)) => {
                self.received += neighbors.nodes.len();
                self.collected.extend(neighbors.nodes.iter().cloned());
                (true, self.received >= *max)
            }
            (ReplyMatch::EnrResponseOf(hash), Packet::EnrResponse(response)) => {
                if response.reply_tok.as_slice() == hash {
                    self.reply = Some(packet.clone());
                    (true, true)
                } else {
                    (false, false)
                }
            }
            _ => (false, false),
        }
    }

    fn complete(self, result: Result<Reply, RequestError>) {
        METRICS.pending_requests.fetch_sub(1, Ordering::Relaxed);
        let _ = self.tx.send(result);
    }

    fn complete_done(mut self) {
        let result = if matches!(self.expect, ReplyMatch::NeighborsUpTo(_)) {
            Ok(Reply::Neighbors(std::mem::take(&mut self.collected)))
        } else {
            match self.reply.take() {
                Some(Packet::Pong(pong)) => Ok(Reply::Pong(pong)),
                Some(Packet::EnrResponse(response)) => Ok(Reply::EnrResponse(response)),
                // feed() stores the packet before declaring completion.
                _ => Err(RequestError::Closed),
            }
        };
        self.complete(result);
    }

    /// A timed-out findnode that received at least one chunk yields the
    /// partial node list instead of an error.
    fn complete_timeout(mut self) {
        if matches!(self.expect, ReplyMatch::NeighborsUpTo(_)) && self.received > 0 {
            let nodes = std::mem::take(&mut self.collected);
            self.complete(Ok(Reply::Neighbors(nodes)));
        } else {
            self.complete(Err(RequestError::Timeout));
        }
    }
}

struct IncomingReply {
    from: NodeId,
    ip: IpAddr,
    port: u16,
    packet: Packet,
    matched: oneshot::Sender<bool>,
}

/// Handle to the dispatcher task.
#[derive(Clone)]
pub(crate) struct ReplyRegistry {
    add: mpsc::Sender<Matcher>,
    replies: mpsc::Sender<IncomingReply>,
    closed: Arc<AtomicBool>,
}

impl ReplyRegistry {
    /// Spawns the dispatcher task. Firing (or dropping) the returned exit
    /// channel fails all live matchers with [`RequestError::Closed`].
    pub fn spawn(
        reply_timeout: Duration,
        clock: Clock,
        on_clock_drift: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> (Self, oneshot::Sender<()>) {
        let (exit_sender, exit) = oneshot::channel();
        let (add_tx, add_rx) = mpsc::channel(10);
        let (reply_tx, reply_rx) = mpsc::channel(10);
        let closed = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            matchers: VecDeque::new(),
            reply_timeout,
            clock,
            cont_timeouts: 0,
            last_drift_warning: None,
            on_clock_drift,
            add_rx,
            reply_rx,
            exit,
            closed: closed.clone(),
        };
        tokio::spawn(dispatcher.run());

        (
            ReplyRegistry {
                add: add_tx,
                replies: reply_tx,
                closed,
            },
            exit_sender,
        )
    }

    /// Registers a matcher for a reply of the kind implied by `expect` from
    /// `(from, ip, port)`. Fails with `Closed` once the registry is shut.
    pub async fn pending(
        &self,
        from: NodeId,
        ip: IpAddr,
        port: u16,
        expect: ReplyMatch,
    ) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if self.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(RequestError::Closed));
            return PendingReply { rx };
        }
        let matcher = Matcher {
            from,
            ip,
            port,
            expect,
            deadline: Instant::now(),
            collected: Vec::new(),
            received: 0,
            reply: None,
            tx,
        };
        // If the dispatcher is gone the matcher (and its sender) is dropped,
        // which resolves the handle with `Closed`.
        let _ = self.add.send(matcher).await;
        PendingReply { rx }
    }

    /// Dispatches a decoded reply packet to the matchers. Returns whether
    /// any matcher accepted it; `false` after shutdown.
    pub async fn dispatch(&self, from: NodeId, ip: IpAddr, port: u16, packet: Packet) -> bool {
        let (matched_tx, matched_rx) = oneshot::channel();
        let incoming = IncomingReply {
            from,
            ip,
            port,
            packet,
            matched: matched_tx,
        };
        if self.replies.send(incoming).await.is_err() {
            return false;
        }
        matched_rx.await.unwrap_or(false)
    }
}

struct Dispatcher {
    /// Live matchers in insertion order.
    matchers: VecDeque<Matcher>,
    reply_timeout: Duration,
    clock: Clock,
    /// Number of continuous timeouts, for NTP drift detection.
    cont_timeouts: u32,
    last_drift_warning: Option<SystemTime>,
    on_clock_drift: Option<Arc<dyn Fn() + Send + Sync>>,
    add_rx: mpsc::Receiver<Matcher>,
    reply_rx: mpsc::Receiver<IncomingReply>,
    exit: oneshot::Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            // Matchers whose deadline sits too far out can only exist if the
            // clock jumped backwards after the deadline was assigned; evict
            // them before arming the timer.
            let now = (self.clock)();
            let horizon = now + self.reply_timeout * 2;
            let mut i = 0;
            while i < self.matchers.len() {
                if self.matchers[i].deadline > horizon {
                    if let Some(matcher) = self.matchers.remove(i) {
                        matcher.complete(Err(RequestError::ClockWarp));
                    }
                } else {
                    i += 1;
                }
            }

            // Arm the timer for the earliest deadline; park it when idle.
            // The delay is measured against the injected clock so a warped
            // clock cannot produce an immediately-firing timer.
            let next_delay = self
                .matchers
                .iter()
                .map(|m| m.deadline)
                .min()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                _ = &mut self.exit => {
                    self.shutdown();
                    return;
                }
                Some(matcher) = self.add_rx.recv() => {
                    let mut matcher = matcher;
                    matcher.deadline = (self.clock)() + self.reply_timeout;
                    METRICS.pending_requests.fetch_add(1, Ordering::Relaxed);
                    self.matchers.push_back(matcher);
                }
                Some(reply) = self.reply_rx.recv() => {
                    self.handle_reply(reply);
                }
                _ = tokio::time::sleep(next_delay) => {
                    self.expire((self.clock)());
                }
            }
        }
    }

    fn handle_reply(&mut self, reply: IncomingReply) {
        let kind = reply.packet.kind();
        let mut matched = false;
        let mut i = 0;
        while i < self.matchers.len() {
            let matcher = &mut self.matchers[i];
            let applicable = matcher.from == reply.from
                && matcher.ip == reply.ip
                && matcher.port == reply.port
                && matcher.expect.packet_kind() == kind;
            if !applicable {
                i += 1;
                continue;
            }
            let (accepted, done) = matcher.feed(&reply.packet);
            if accepted {
                matched = true;
                self.cont_timeouts = 0;
            }
            if done {
                if let Some(matcher) = self.matchers.remove(i) {
                    matcher.complete_done();
                }
            } else {
                i += 1;
            }
        }
        let _ = reply.matched.send(matched);
    }

    fn expire(&mut self, now: Instant) {
        let mut timeouts = 0;
        let mut i = 0;
        while i < self.matchers.len() {
            if self.matchers[i].deadline <= now {
                if let Some(matcher) = self.matchers.remove(i) {
                    matcher.complete_timeout();
                    timeouts += 1;
                }
            } else {
                i += 1;
            }
        }
        if timeouts > 0 {
            self.note_timeouts(timeouts);
        }
    }

    fn note_timeouts(&mut self, count: u32) {
        self.cont_timeouts += count;
        if self.cont_timeouts <= NTP_FAILURE_THRESHOLD {
            return;
        }
        self.cont_timeouts = 0;
        let now = SystemTime::now();
        let due = self
            .last_drift_warning
            .and_then(|at| now.duration_since(at).ok())
            .map(|elapsed| elapsed >= NTP_WARNING_COOLDOWN)
            .unwrap_or(true);
        if due {
            self.last_drift_warning = Some(now);
            warn!("Continuous request timeouts, system clock may be off");
            METRICS.event(CLOCK_DRIFT_SUSPECTED);
            if let Some(hook) = &self.on_clock_drift {
                hook();
            }
        }
    }

    fn shutdown(&mut self) {
        self.closed.store(true, Ordering::Release);
        debug!(
            matchers = self.matchers.len(),
            "Reply dispatcher shutting down"
        );
        for matcher in self.matchers.drain(..) {
            matcher.complete(Err(RequestError::Closed));
        }
        self.add_rx.close();
        // Matchers still queued for addition were never counted as pending.
        while let Ok(matcher) = self.add_rx.try_recv() {
            let _ = matcher.tx.send(Err(RequestError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enr::k256::ecdsa::SigningKey;
    use parking_lot::Mutex;
    use rand::rngs::OsRng;
    use std::net::Ipv4Addr;

    fn default_clock() -> Clock {
        Arc::new(Instant::now)
    }

    fn peer() -> (NodeId, IpAddr, u16) {
        let key = wire::Pubkey::from_signing_key(&SigningKey::random(&mut OsRng));
        (key.id(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 30303)
    }

    fn pong_with(tok: &[u8]) -> Packet {
        Packet::Pong(wire::Pong {
            to: wire::Endpoint::new("10.0.0.2".parse().unwrap(), 30303, 0),
            reply_tok: tok.to_vec(),
            expiration: wire::unix_now() + 20,
            enr_seq: Some(3),
        })
    }

    fn neighbors_with(count: usize) -> Packet {
        let nodes = (0..count)
            .map(|_| wire::Node {
                ip: "10.0.0.3".parse().unwrap(),
                udp_port: 30303,
                tcp_port: 0,
                id: wire::Pubkey::from_signing_key(&SigningKey::random(&mut OsRng)),
            })
            .collect();
        Packet::Neighbors(wire::Neighbors {
            nodes,
            expiration: wire::unix_now() + 20,
        })
    }

    #[tokio::test]
    async fn pong_matches_on_reply_token() {
        let (registry, _exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), None);
        let (id, ip, port) = peer();
        let hash = [7u8; 32];

        let handle = registry.pending(id, ip, port, ReplyMatch::PongOf(hash)).await;
        assert!(!registry.dispatch(id, ip, port, pong_with(&[1u8; 32])).await);
        assert!(registry.dispatch(id, ip, port, pong_with(&hash)).await);

        match handle.resolve().await.unwrap() {
            Reply::Pong(pong) => assert_eq!(pong.enr_seq, Some(3)),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_only_match_the_right_endpoint() {
        let (registry, _exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), None);
        let (id, ip, port) = peer();
        let hash = [7u8; 32];
        let _handle = registry.pending(id, ip, port, ReplyMatch::PongOf(hash)).await;

        let (other_id, ..) = peer();
        assert!(!registry.dispatch(other_id, ip, port, pong_with(&hash)).await);
        assert!(!registry.dispatch(id, ip, port + 1, pong_with(&hash)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_once() {
        let (registry, _exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), None);
        let (id, ip, port) = peer();
        let handle = registry
            .pending(id, ip, port, ReplyMatch::PongOf([0u8; 32]))
            .await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.resolve().await.unwrap_err(), RequestError::Timeout);
        // The matcher is gone; a late reply matches nothing.
        assert!(!registry.dispatch(id, ip, port, pong_with(&[0u8; 32])).await);
    }

    #[tokio::test(start_paused = true)]
    async fn neighbors_accumulate_across_chunks() {
        let (registry, _exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), None);
        let (id, ip, port) = peer();
        let handle = registry
            .pending(id, ip, port, ReplyMatch::NeighborsUpTo(16))
            .await;

        assert!(registry.dispatch(id, ip, port, neighbors_with(12)).await);
        assert!(registry.dispatch(id, ip, port, neighbors_with(4)).await);

        match handle.resolve().await.unwrap() {
            Reply::Neighbors(nodes) => assert_eq!(nodes.len(), 16),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_neighbors_suppress_timeout() {
        let (registry, _exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), None);
        let (id, ip, port) = peer();
        let handle = registry
            .pending(id, ip, port, ReplyMatch::NeighborsUpTo(16))
            .await;

        assert!(registry.dispatch(id, ip, port, neighbors_with(5)).await);
        tokio::time::sleep(Duration::from_secs(1)).await;

        match handle.resolve().await.unwrap() {
            Reply::Neighbors(nodes) => assert_eq!(nodes.len(), 5),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_fails_live_and_future_matchers() {
        let (registry, exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), None);
        let (id, ip, port) = peer();
        let live = registry
            .pending(id, ip, port, ReplyMatch::PongOf([0u8; 32]))
            .await;

        exit.send(()).unwrap();
        assert_eq!(live.resolve().await.unwrap_err(), RequestError::Closed);

        // Wait for the closed flag to settle, then check synchronous failure.
        tokio::task::yield_now().await;
        let late = registry
            .pending(id, ip, port, ReplyMatch::PongOf([0u8; 32]))
            .await;
        assert_eq!(late.resolve().await.unwrap_err(), RequestError::Closed);
        assert!(!registry.dispatch(id, ip, port, pong_with(&[0u8; 32])).await);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_timeouts_trigger_drift_hook() {
        let drift_checks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hook = {
            let drift_checks = drift_checks.clone();
            Arc::new(move || {
                drift_checks.fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn Fn() + Send + Sync>
        };
        let (registry, _exit) =
            ReplyRegistry::spawn(Duration::from_millis(750), default_clock(), Some(hook));
        let (id, ip, port) = peer();

        let mut handles = Vec::new();
        for _ in 0..NTP_FAILURE_THRESHOLD + 1 {
            handles.push(
                registry
                    .pending(id, ip, port, ReplyMatch::PongOf([0u8; 32]))
                    .await,
            );
        }
        for handle in handles {
            assert_eq!(handle.resolve().await.unwrap_err(), RequestError::Timeout);
        }
        assert_eq!(drift_checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clock_warp_evicts_matcher() {
        let warp = Arc::new(Mutex::new(Duration::ZERO));
        let warp_clock = warp.clone();
        let clock: Clock = Arc::new(move || Instant::now() - *warp_clock.lock());

        let (registry, _exit) = ReplyRegistry::spawn(Duration::from_millis(750), clock, None);
        let (id, ip, port) = peer();
        let stale = registry
            .pending(id, ip, port, ReplyMatch::PongOf([0u8; 32]))
            .await;

        // The clock jumps back by 10x the reply timeout, leaving the first
        // matcher's deadline far in the future. The next dispatcher tick
        // (here triggered by a second registration) must evict it.
        *warp.lock() = Duration::from_millis(7500);
        let fresh = registry
            .pending(id, ip, port, ReplyMatch::PongOf([1u8; 32]))
            .await;

        assert_eq!(stale.resolve().await.unwrap_err(), RequestError::ClockWarp);
        assert!(registry.dispatch(id, ip, port, pong_with(&[1u8; 32])).await);
        assert!(fresh.resolve().await.is_ok());
    }
}
