//! The player's identity on the broker and the retry policy that keeps it alive.
//!
//! A session owns at most one [`PeerHandle`] at a time.  Errors the broker reports as
//! fatal destroy the identity; a new one is created with the same requested id after
//! `fatal_backoff`.  A dropped broker socket is first reconnected in place; if that has
//! not succeeded after `disconnect_grace` the identity is thrown away and recreated.
//!
//! There are no background threads.  The owner calls [`PeerSession::poll`] from its
//! loop and expired timers fire from there, the same way the transport events fire
//! from whatever drives the transport.
//!
//! ```text
//!  Uninitialized --start--> Connecting --open--> Open
//!                               ^                  | disconnected
//!                               |                  v
//!         backoff expired ---- Destroyed <--- Disconnected (reconnect in place)
//!                               ^   fatal error / close / grace expired
//! ```
use log::{debug, info, warn};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use super::peer_error::PeerError;
use super::transport::{DataLink, MediaLink, PeerEvent, PeerEventKind, PeerFactory, PeerHandle};
use crate::common::{
    emitter::{Emitter, EventKind, Subscription},
    get_micro_time,
    micro_timer::{MicroTimer, MICROS_PER_SEC},
    settings::Settings,
};

pub type Clock = Rc<dyn Fn() -> u128>;

pub const DEFAULT_FATAL_BACKOFF_SECS: u32 = 10;
pub const DEFAULT_DISCONNECT_GRACE_SECS: u32 = 11;

#[derive(Clone)]
pub struct SessionOptions {
    /// wait after a fatal error before recreating the identity
    pub fatal_backoff_secs: u32,
    /// how long an in-place reconnect may take before the identity is recreated
    pub disconnect_grace_secs: u32,
    pub clock: Clock,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            fatal_backoff_secs: DEFAULT_FATAL_BACKOFF_SECS,
            disconnect_grace_secs: DEFAULT_DISCONNECT_GRACE_SECS,
            clock: Rc::new(get_micro_time),
        }
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> SessionOptions {
        SessionOptions {
            fatal_backoff_secs: settings.fatal_backoff_secs,
            disconnect_grace_secs: settings.disconnect_grace_secs,
            ..SessionOptions::default()
        }
    }
    pub fn with_clock(mut self, clock: Clock) -> SessionOptions {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Open,
    Disconnected,
    Destroyed,
    /// torn down by the owner, no retries
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RetryReason {
    FatalBackoff,
    DisconnectGrace,
}

/// What the UI shows about the local player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub local_id: String,
    pub is_open: bool,
    pub last_error: Option<PeerError>,
}

#[derive(Debug)]
pub enum SessionEvent {
    Open(String),
    Error(PeerError),
    IncomingConnection(Rc<dyn DataLink>),
    IncomingCall(Rc<dyn MediaLink>),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEventKind {
    Open,
    Error,
    IncomingConnection,
    IncomingCall,
    Disconnected,
}

impl EventKind for SessionEvent {
    type Kind = SessionEventKind;
    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Open(_) => SessionEventKind::Open,
            SessionEvent::Error(_) => SessionEventKind::Error,
            SessionEvent::IncomingConnection(_) => SessionEventKind::IncomingConnection,
            SessionEvent::IncomingCall(_) => SessionEventKind::IncomingCall,
            SessionEvent::Disconnected => SessionEventKind::Disconnected,
        }
    }
}

struct SessionInner {
    requested_id: String,
    local_id: String,
    state: SessionState,
    last_error: Option<PeerError>,
    peer: Option<Rc<dyn PeerHandle>>,
    // handlers on the current peer, dropped before it is destroyed
    listeners: Vec<Subscription>,
    retry: Option<(RetryReason, MicroTimer)>,
    identities_created: u32,
}

struct SessionCore {
    inner: RefCell<SessionInner>,
    events: Emitter<SessionEvent>,
    factory: Rc<dyn PeerFactory>,
    options: SessionOptions,
}

/// Cheap to clone, clones share one session.
#[derive(Clone)]
pub struct PeerSession {
    core: Rc<SessionCore>,
}

impl PeerSession {
    pub fn new(factory: Rc<dyn PeerFactory>, requested_id: &str, options: SessionOptions) -> PeerSession {
        PeerSession {
            core: Rc::new(SessionCore {
                inner: RefCell::new(SessionInner {
                    requested_id: requested_id.to_string(),
                    local_id: requested_id.to_string(),
                    state: SessionState::Uninitialized,
                    last_error: None,
                    peer: None,
                    listeners: vec![],
                    retry: None,
                    identities_created: 0,
                }),
                events: Emitter::new(),
                factory,
                options,
            }),
        }
    }

    /// create the first identity.  Does nothing once started.
    pub fn start(&self) {
        if self.state() != SessionState::Uninitialized {
            debug!("peer_session: already started");
            return;
        }
        self.core.create_identity();
    }

    /// fire any expired retry timer
    pub fn poll(&self) {
        self.core.poll();
    }

    /// tear down for good: no retry is scheduled afterwards
    pub fn shutdown(&self) {
        self.core.cancel_retry();
        self.core.teardown();
        self.core.inner.borrow_mut().state = SessionState::Shutdown;
        info!("peer_session: shut down");
    }

    pub fn events(&self) -> &Emitter<SessionEvent> {
        &self.core.events
    }

    pub fn identity(&self) -> PeerIdentity {
        let inner = self.core.inner.borrow();
        PeerIdentity {
            local_id: inner.local_id.clone(),
            is_open: inner.state == SessionState::Open,
            last_error: inner.last_error.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.inner.borrow().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// the current identity, absent between a teardown and its recreation
    pub fn peer(&self) -> Option<Rc<dyn PeerHandle>> {
        self.core.inner.borrow().peer.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.core.inner.borrow().retry.is_some()
    }

    /// microseconds until the pending retry fires
    pub fn retry_remaining(&self) -> Option<u128> {
        let now = (self.core.options.clock)();
        self.core.inner.borrow().retry.as_ref().map(|(_, t)| t.remaining(now))
    }

    pub fn identities_created(&self) -> u32 {
        self.core.inner.borrow().identities_created
    }
}

impl SessionCore {
    fn create_identity(self: &Rc<Self>) {
        self.cancel_retry();
        let requested = self.inner.borrow().requested_id.clone();
        info!("peer_session: registering as '{}'", requested);
        let peer = self.factory.create(&requested);
        let listeners = self.listen(&peer);
        let mut inner = self.inner.borrow_mut();
        inner.peer = Some(peer);
        inner.listeners = listeners;
        inner.state = SessionState::Connecting;
        inner.identities_created += 1;
    }

    fn listen(self: &Rc<Self>, peer: &Rc<dyn PeerHandle>) -> Vec<Subscription> {
        let events = peer.events();
        let mut listeners = Vec::with_capacity(6);

        let weak = Rc::downgrade(self);
        listeners.push(events.subscribe(PeerEventKind::Open, move |e| {
            if let (Some(core), PeerEvent::Open(id)) = (weak.upgrade(), e) {
                core.on_open(id);
            }
        }));
        let weak = Rc::downgrade(self);
        listeners.push(events.subscribe(PeerEventKind::Error, move |e| {
            if let (Some(core), PeerEvent::Error(err)) = (weak.upgrade(), e) {
                core.on_error(err);
            }
        }));
        let weak = Rc::downgrade(self);
        listeners.push(events.subscribe(PeerEventKind::Connection, move |e| {
            if let (Some(core), PeerEvent::Connection(link)) = (weak.upgrade(), e) {
                info!("peer_session: incoming connection from {}", link.peer());
                core.events.emit(&SessionEvent::IncomingConnection(link.clone()));
            }
        }));
        let weak = Rc::downgrade(self);
        listeners.push(events.subscribe(PeerEventKind::Call, move |e| {
            if let (Some(core), PeerEvent::Call(call)) = (weak.upgrade(), e) {
                info!("peer_session: incoming call from {}", call.peer());
                core.events.emit(&SessionEvent::IncomingCall(call.clone()));
            }
        }));
        let weak = Rc::downgrade(self);
        listeners.push(events.subscribe(PeerEventKind::Disconnected, move |_| {
            if let Some(core) = weak.upgrade() {
                core.on_disconnected();
            }
        }));
        let weak: Weak<SessionCore> = Rc::downgrade(self);
        listeners.push(events.subscribe(PeerEventKind::Close, move |_| {
            if let Some(core) = weak.upgrade() {
                core.on_close();
            }
        }));
        listeners
    }

    fn on_open(&self, id: &str) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.local_id != id {
                info!("peer_session: broker assigned '{}'", id);
            }
            inner.local_id = id.to_string();
            inner.state = SessionState::Open;
            inner.last_error = None;
        }
        self.cancel_retry();
        info!("peer_session: open as '{}'", id);
        self.events.emit(&SessionEvent::Open(id.to_string()));
    }

    fn on_error(&self, err: &PeerError) {
        self.inner.borrow_mut().last_error = Some(err.clone());
        if err.is_fatal() {
            warn!("peer_session: fatal error {}", err);
            self.teardown();
            self.arm_retry(RetryReason::FatalBackoff);
        } else {
            warn!("peer_session: non-fatal error {}", err);
        }
        self.events.emit(&SessionEvent::Error(err.clone()));
    }

    fn on_disconnected(&self) {
        let peer = {
            let inner = self.inner.borrow();
            if inner.retry.is_some() {
                info!("peer_session: disconnected while already recovering, ignored");
                None
            } else {
                inner.peer.clone()
            }
        };
        if let Some(peer) = peer {
            warn!("peer_session: lost the broker, reconnecting in place");
            self.inner.borrow_mut().state = SessionState::Disconnected;
            self.arm_retry(RetryReason::DisconnectGrace);
            peer.reconnect();
        }
        self.events.emit(&SessionEvent::Disconnected);
    }

    fn on_close(&self) {
        // only reachable for a peer we did not destroy ourselves, listeners go first
        warn!("peer_session: identity closed unexpectedly");
        self.teardown();
        self.arm_retry(RetryReason::FatalBackoff);
    }

    /// unsubscribe, then destroy.  Never schedules anything.
    fn teardown(&self) {
        let (peer, listeners) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != SessionState::Shutdown {
                inner.state = SessionState::Destroyed;
            }
            (inner.peer.take(), std::mem::take(&mut inner.listeners))
        };
        drop(listeners);
        if let Some(peer) = peer {
            info!("peer_session: destroying '{}'", peer.id());
            peer.destroy();
        }
    }

    fn arm_retry(&self, reason: RetryReason) {
        let now = (self.options.clock)();
        let secs = match reason {
            RetryReason::FatalBackoff => self.options.fatal_backoff_secs,
            RetryReason::DisconnectGrace => self.options.disconnect_grace_secs,
        };
        // a zero timer would retry on every poll
        let timer = MicroTimer::from_secs(now, secs.max(1));
        info!(
            "peer_session: {:?}, retrying in {} secs",
            reason,
            timer.get_interval() / MICROS_PER_SEC
        );
        self.inner.borrow_mut().retry = Some((reason, timer));
    }

    fn cancel_retry(&self) {
        if let Some((reason, _)) = self.inner.borrow_mut().retry.take() {
            debug!("peer_session: cancelled {:?} timer", reason);
        }
    }

    fn poll(self: &Rc<Self>) {
        let now = (self.options.clock)();
        let due = match &self.inner.borrow().retry {
            Some((reason, timer)) if timer.expired(now) => Some(*reason),
            _ => None,
        };
        match due {
            Some(RetryReason::FatalBackoff) => {
                info!("peer_session: backoff complete");
                self.create_identity();
            }
            Some(RetryReason::DisconnectGrace) => {
                warn!("peer_session: reconnect did not finish in time, recreating");
                self.teardown();
                self.create_identity();
            }
            None => {}
        }
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.listeners.clear();
        if let Some(peer) = inner.peer.take() {
            peer.destroy();
        }
    }
}

#[cfg(test)]
mod test_peer_session {
    use super::*;
    use crate::peer::loopback::LoopbackBroker;
    use crate::peer::peer_error::PeerErrorKind;
    use std::cell::Cell;

    struct Rig {
        broker: LoopbackBroker,
        now: Rc<Cell<u128>>,
        session: PeerSession,
    }

    impl Rig {
        fn new(name: &str) -> Rig {
            let broker = LoopbackBroker::new();
            let now = Rc::new(Cell::new(1_000_000u128));
            let n = now.clone();
            let options = SessionOptions::default().with_clock(Rc::new(move || n.get()));
            let session = PeerSession::new(Rc::new(broker.clone()), name, options);
            Rig { broker, now, session }
        }
        fn advance_secs(&self, secs: u128) {
            self.now.set(self.now.get() + secs * MICROS_PER_SEC);
            self.session.poll();
            self.broker.pump();
        }
    }

    #[test]
    fn opens_with_requested_id() {
        let rig = Rig::new("alice");
        assert_eq!(rig.session.state(), SessionState::Uninitialized);
        assert_eq!(rig.session.identity().local_id, "alice");
        rig.session.start();
        assert_eq!(rig.session.state(), SessionState::Connecting);
        assert!(!rig.session.identity().is_open);
        rig.broker.pump();
        let identity = rig.session.identity();
        assert_eq!(identity, PeerIdentity { local_id: "alice".to_string(), is_open: true, last_error: None });
        // start twice is harmless
        rig.session.start();
        assert_eq!(rig.session.identities_created(), 1);
    }

    #[test]
    fn broker_assigned_id() {
        let rig = Rig::new("");
        rig.session.start();
        rig.broker.pump();
        assert_eq!(rig.session.identity().local_id, "ROOM-1");
    }

    #[test]
    fn fatal_error_recreates_after_backoff() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        let first = rig.session.peer().unwrap();
        rig.broker.inject_error("alice", PeerErrorKind::Network, "Lost connection to server.");
        rig.broker.pump();

        assert!(first.is_destroyed());
        assert!(rig.session.peer().is_none());
        assert_eq!(rig.session.state(), SessionState::Destroyed);
        assert!(rig.session.is_reconnecting());
        let identity = rig.session.identity();
        assert!(!identity.is_open);
        assert_eq!(identity.last_error.unwrap().kind, PeerErrorKind::Network);
        assert_eq!(first.events().listener_count(), 0);

        rig.advance_secs(5);
        assert!(rig.session.peer().is_none());
        rig.advance_secs(6);
        assert!(rig.session.is_open());
        assert_eq!(rig.session.identities_created(), 2);
        assert_eq!(rig.session.identity().last_error, None);
        assert!(!rig.session.is_reconnecting());
    }

    #[test]
    fn zero_timers_still_wait_a_second() {
        let broker = LoopbackBroker::new();
        broker.set_online(false);
        let now = Rc::new(Cell::new(0u128));
        let n = now.clone();
        let options = SessionOptions {
            fatal_backoff_secs: 0,
            disconnect_grace_secs: 0,
            ..SessionOptions::default()
        }
        .with_clock(Rc::new(move || n.get()));
        let session = PeerSession::new(Rc::new(broker.clone()), "alice", options);
        session.start();
        broker.pump();
        assert_eq!(session.state(), SessionState::Destroyed);
        assert_eq!(session.retry_remaining(), Some(MICROS_PER_SEC));

        for _ in 0..5 {
            now.set(now.get() + 1);
            session.poll();
            broker.pump();
        }
        assert_eq!(session.identities_created(), 1);

        now.set(now.get() + MICROS_PER_SEC);
        session.poll();
        broker.pump();
        assert_eq!(session.identities_created(), 2);
    }

    #[test]
    fn recoverable_error_keeps_identity() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        rig.broker.inject_error("alice", PeerErrorKind::from("peer-unavailable"), "Could not connect to peer bob");
        rig.broker.pump();
        assert!(rig.session.is_open());
        assert!(!rig.session.is_reconnecting());
        assert_eq!(
            rig.session.identity().last_error.map(|e| e.kind),
            Some(PeerErrorKind::Other("peer-unavailable".to_string()))
        );
        assert_eq!(rig.session.identities_created(), 1);
    }

    #[test]
    fn disconnect_reconnects_in_place() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        let peer = rig.session.peer().unwrap();
        rig.broker.disconnect("alice");
        // nothing delivered yet
        assert!(rig.session.is_open());
        rig.broker.pump();
        assert!(rig.session.is_open());
        assert!(!rig.session.is_reconnecting());
        assert_eq!(rig.session.identities_created(), 1);
        assert!(!peer.is_disconnected());
    }

    #[test]
    fn disconnect_grace_expires_into_recreate() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        rig.broker.set_online(false);
        rig.broker.disconnect("alice");
        rig.broker.pump();
        // reconnect failed with network, which is fatal and replaces the grace timer
        assert_eq!(rig.session.state(), SessionState::Destroyed);
        rig.broker.set_online(true);
        rig.advance_secs(11);
        assert!(rig.session.is_open());
        assert_eq!(rig.session.identities_created(), 2);
    }

    #[test]
    fn repeated_disconnect_is_ignored_while_recovering() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        let disconnects = Rc::new(Cell::new(0));
        let d = disconnects.clone();
        let _sub = rig.session.events().subscribe(SessionEventKind::Disconnected, move |_| d.set(d.get() + 1));
        let peer = rig.session.peer().unwrap();
        // two drops queued before either reconnect runs
        rig.broker.disconnect("alice");
        rig.broker.disconnect("alice");
        rig.broker.pump();
        assert_eq!(disconnects.get(), 2);
        assert!(rig.session.is_open());
        assert!(std::ptr::eq(
            Rc::as_ptr(&peer) as *const (),
            Rc::as_ptr(&rig.session.peer().unwrap()) as *const ()
        ));
    }

    #[test]
    fn stalled_reconnect_recreates_after_grace() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        // the broker never saw the drop, so the in-place reconnect is a no-op and stalls
        rig.session.core.on_disconnected();
        assert_eq!(rig.session.state(), SessionState::Disconnected);
        assert!(rig.session.is_reconnecting());
        assert_eq!(rig.session.retry_remaining(), Some(11 * MICROS_PER_SEC));
        // the timer is strict: exactly at the deadline nothing happens
        rig.now.set(rig.now.get() + 11 * MICROS_PER_SEC);
        rig.session.poll();
        assert_eq!(rig.session.identities_created(), 1);
        rig.now.set(rig.now.get() + 1);
        rig.session.poll();
        assert_eq!(rig.session.identities_created(), 2);
        assert_eq!(rig.session.state(), SessionState::Connecting);
        rig.broker.pump();
        assert!(rig.session.is_open());
        assert_eq!(rig.session.identity().local_id, "alice");
    }

    #[test]
    fn unavailable_id_keeps_trying() {
        let rig = Rig::new("alice");
        let squatter = rig.broker.create("alice");
        rig.broker.pump();
        rig.session.start();
        rig.broker.pump();
        assert_eq!(
            rig.session.identity().last_error.map(|e| e.kind),
            Some(PeerErrorKind::UnavailableId)
        );
        squatter.destroy();
        rig.advance_secs(11);
        assert!(rig.session.is_open());
    }

    #[test]
    fn incoming_links_are_forwarded() {
        let rig = Rig::new("alice");
        rig.session.start();
        let caller = rig.broker.create("bob");
        rig.broker.pump();
        let seen = Rc::new(RefCell::new(vec![]));
        let s = seen.clone();
        let _sub = rig.session.events().subscribe(SessionEventKind::IncomingConnection, move |e| {
            if let SessionEvent::IncomingConnection(link) = e {
                s.borrow_mut().push(link.peer());
            }
        });
        caller.connect("alice", Default::default());
        rig.broker.pump();
        assert_eq!(*seen.borrow(), vec!["bob".to_string()]);
    }

    #[test]
    fn shutdown_never_retries() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        let peer = rig.session.peer().unwrap();
        rig.session.shutdown();
        assert!(peer.is_destroyed());
        assert_eq!(peer.events().listener_count(), 0);
        rig.advance_secs(60);
        assert_eq!(rig.session.state(), SessionState::Shutdown);
        assert_eq!(rig.session.identities_created(), 1);
        assert!(rig.broker.peers().is_empty());
    }

    #[test]
    fn unexpected_close_is_fatal() {
        let rig = Rig::new("alice");
        rig.session.start();
        rig.broker.pump();
        let peer = rig.session.peer().unwrap();
        // destroyed behind the session's back
        peer.destroy();
        rig.broker.pump();
        assert_eq!(rig.session.state(), SessionState::Destroyed);
        assert!(rig.session.is_reconnecting());
        rig.advance_secs(11);
        assert!(rig.session.is_open());
    }
}
