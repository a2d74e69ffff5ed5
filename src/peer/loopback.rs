//! In-memory broker.
//!
//! Implements the transport traits without any network: identities register with a
//! [`LoopbackBroker`], links between them are pairs of in-memory endpoints, and every
//! event is queued and only delivered when the owner calls [`LoopbackBroker::pump`].
//! That gives tests and demos full control over ordering, plus a few knobs to inject
//! the failures a real broker produces (errors, dropped broker sockets, outages).
use log::{debug, info, warn};
use serde_json::Value;
use simple_error::bail;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use super::peer_error::{PeerError, PeerErrorKind};
use super::transport::{
    ConnectOptions, DataEvent, DataLink, MediaEvent, MediaLink, MediaStream, Metadata, PeerEvent,
    PeerFactory, PeerHandle,
};
use crate::broker::broker_api::PeerDirectory;
use crate::common::{box_error::BoxError, emitter::Emitter};
use crate::media::local_media::{DeviceInfo, DeviceKind, MediaConstraints, MediaDevices};

// a runaway ping-pong between handlers should not hang the caller
const MAX_DELIVERIES_PER_PUMP: usize = 100_000;

type Delivery = Box<dyn FnOnce()>;
type BrokerRef = Weak<RefCell<BrokerState>>;

struct BrokerState {
    online: bool,
    next_room: u64,
    registered: HashMap<String, Weak<LoopbackPeer>>,
    queue: VecDeque<Delivery>,
}

fn enqueue(broker: &BrokerRef, delivery: impl FnOnce() + 'static) {
    if let Some(state) = broker.upgrade() {
        state.borrow_mut().queue.push_back(Box::new(delivery));
    }
}

fn lookup(broker: &BrokerRef, id: &str) -> Option<Rc<LoopbackPeer>> {
    let state = broker.upgrade()?;
    let found = state.borrow().registered.get(id).and_then(|p| p.upgrade());
    found.filter(|p| p.open.get() && !p.destroyed.get())
}

#[derive(Clone)]
pub struct LoopbackBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        LoopbackBroker::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> LoopbackBroker {
        LoopbackBroker {
            state: Rc::new(RefCell::new(BrokerState {
                online: true,
                next_room: 1,
                registered: HashMap::new(),
                queue: VecDeque::new(),
            })),
        }
    }

    fn weak(&self) -> BrokerRef {
        Rc::downgrade(&self.state)
    }

    /// deliver queued events, including the ones queued while delivering, until idle
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state.borrow_mut().queue.pop_front();
            match next {
                Some(delivery) => {
                    delivery();
                    delivered += 1;
                    if delivered >= MAX_DELIVERIES_PER_PUMP {
                        warn!("loopback: pump stopped after {} deliveries", delivered);
                        break;
                    }
                }
                None => break,
            }
        }
        delivered
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// while offline every registration and reconnect fails with a network error
    pub fn set_online(&self, online: bool) {
        info!("loopback: broker {}", if online { "online" } else { "offline" });
        self.state.borrow_mut().online = online;
    }

    /// ids of the live registrations, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .borrow()
            .registered
            .iter()
            .filter(|(_, p)| p.upgrade().map_or(false, |p| !p.destroyed.get()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn registered(&self, id: &str) -> Option<Rc<LoopbackPeer>> {
        let found = self.state.borrow().registered.get(id).and_then(|p| p.upgrade());
        found
    }

    /// queue a broker error for the identity registered as `id`
    pub fn inject_error(&self, id: &str, kind: PeerErrorKind, message: &str) -> bool {
        match self.registered(id) {
            Some(peer) => {
                let err = PeerError::new(kind, message);
                enqueue(&self.weak(), move || {
                    if !peer.destroyed.get() {
                        peer.events.emit(&PeerEvent::Error(err));
                    }
                });
                true
            }
            None => false,
        }
    }

    /// drop the broker socket of `id`.  Links and the registration survive.
    pub fn disconnect(&self, id: &str) -> bool {
        match self.registered(id) {
            Some(peer) if !peer.destroyed.get() => {
                peer.disconnected.set(true);
                enqueue(&self.weak(), move || {
                    if !peer.destroyed.get() {
                        peer.events.emit(&PeerEvent::Disconnected);
                    }
                });
                true
            }
            _ => false,
        }
    }
}

impl PeerFactory for LoopbackBroker {
    fn create(&self, requested_id: &str) -> Rc<dyn PeerHandle> {
        let broker = self.weak();
        let peer = Rc::new_cyclic(|me| LoopbackPeer {
            me: me.clone(),
            broker: broker.clone(),
            requested: requested_id.to_string(),
            id: RefCell::new(String::new()),
            open: Cell::new(false),
            disconnected: Cell::new(false),
            destroyed: Cell::new(false),
            data_links: RefCell::new(vec![]),
            media_links: RefCell::new(vec![]),
            events: Emitter::new(),
        });
        let registering = peer.clone();
        enqueue(&broker, move || registering.complete_registration());
        peer
    }
}

impl PeerDirectory for LoopbackBroker {
    fn list_peers(&self) -> Result<Vec<String>, BoxError> {
        if !self.state.borrow().online {
            bail!("loopback broker is offline");
        }
        Ok(self.peers())
    }
}

pub struct LoopbackPeer {
    me: Weak<LoopbackPeer>,
    broker: BrokerRef,
    requested: String,
    id: RefCell<String>,
    open: Cell<bool>,
    disconnected: Cell<bool>,
    destroyed: Cell<bool>,
    data_links: RefCell<Vec<Rc<LoopbackDataLink>>>,
    media_links: RefCell<Vec<Rc<LoopbackMediaLink>>>,
    events: Emitter<PeerEvent>,
}

impl LoopbackPeer {
    fn complete_registration(&self) {
        if self.destroyed.get() {
            return;
        }
        let state = match self.broker.upgrade() {
            Some(state) => state,
            None => return,
        };
        let outcome = {
            let mut state = state.borrow_mut();
            if !state.online {
                Err(PeerError::new(PeerErrorKind::Network, "Lost connection to server."))
            } else {
                let id = if self.requested.is_empty() {
                    let id = format!("ROOM-{}", state.next_room);
                    state.next_room += 1;
                    id
                } else {
                    self.requested.clone()
                };
                let taken = state
                    .registered
                    .get(&id)
                    .and_then(|p| p.upgrade())
                    .map_or(false, |p| !p.destroyed.get());
                if taken {
                    Err(PeerError::new(
                        PeerErrorKind::UnavailableId,
                        format!("ID \"{}\" is taken", id),
                    ))
                } else {
                    state.registered.insert(id.clone(), self.me.clone());
                    Ok(id)
                }
            }
        };
        match outcome {
            Ok(id) => {
                info!("loopback: registered {}", id);
                *self.id.borrow_mut() = id.clone();
                self.open.set(true);
                self.events.emit(&PeerEvent::Open(id));
            }
            Err(e) => {
                warn!("loopback: registration of '{}' failed: {}", self.requested, e);
                self.events.emit(&PeerEvent::Error(e));
            }
        }
    }

    fn peer_unavailable(&self, target: &str) {
        self.events.emit(&PeerEvent::Error(PeerError::new(
            "peer-unavailable",
            format!("Could not connect to peer {}", target),
        )));
    }

    fn complete_connect(&self, target: &str, local: Rc<LoopbackDataLink>) {
        if self.destroyed.get() || local.closed.get() {
            return;
        }
        let remote_peer = match lookup(&self.broker, target) {
            Some(p) => p,
            None => {
                // the link just never opens, same as a real broker
                self.peer_unavailable(target);
                return;
            }
        };
        let remote = LoopbackDataLink::new(&self.broker, &self.id(), local.metadata.clone(), local.label.clone());
        LoopbackDataLink::pair(&local, &remote);
        remote_peer.data_links.borrow_mut().push(remote.clone());
        remote_peer.events.emit(&PeerEvent::Connection(remote.clone()));
        // open next turn so the receiving side can subscribe first
        enqueue(&self.broker, move || {
            local.mark_open();
            remote.mark_open();
        });
    }

    fn complete_call(&self, target: &str, local: Rc<LoopbackMediaLink>) {
        if self.destroyed.get() || local.closed.get() {
            return;
        }
        let remote_peer = match lookup(&self.broker, target) {
            Some(p) => p,
            None => {
                self.peer_unavailable(target);
                return;
            }
        };
        let remote = LoopbackMediaLink::new(&self.broker, &self.id(), local.metadata.clone(), None);
        LoopbackMediaLink::pair(&local, &remote);
        remote_peer.media_links.borrow_mut().push(remote.clone());
        remote_peer.events.emit(&PeerEvent::Call(remote));
    }
}

impl PeerHandle for LoopbackPeer {
    fn id(&self) -> String {
        self.id.borrow().clone()
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.get()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn connect(&self, target: &str, options: ConnectOptions) -> Rc<dyn DataLink> {
        debug!("loopback: {} connecting to {}", self.id(), target);
        let link = LoopbackDataLink::new(&self.broker, target, options.metadata, options.label);
        self.data_links.borrow_mut().push(link.clone());
        let me = self.me.clone();
        let pending = link.clone();
        let target = target.to_string();
        enqueue(&self.broker, move || {
            if let Some(me) = me.upgrade() {
                me.complete_connect(&target, pending);
            }
        });
        link
    }

    fn call(&self, target: &str, stream: &MediaStream, metadata: Metadata) -> Rc<dyn MediaLink> {
        debug!("loopback: {} calling {}", self.id(), target);
        let link = LoopbackMediaLink::new(&self.broker, target, metadata, Some(stream.clone()));
        self.media_links.borrow_mut().push(link.clone());
        let me = self.me.clone();
        let pending = link.clone();
        let target = target.to_string();
        enqueue(&self.broker, move || {
            if let Some(me) = me.upgrade() {
                me.complete_call(&target, pending);
            }
        });
        link
    }

    fn reconnect(&self) {
        if self.destroyed.get() || !self.disconnected.get() {
            warn!("loopback: reconnect of {} ignored", self.id());
            return;
        }
        let me = self.me.clone();
        enqueue(&self.broker, move || {
            let me = match me.upgrade() {
                Some(me) if !me.destroyed.get() => me,
                _ => return,
            };
            let online = me.broker.upgrade().map_or(false, |s| s.borrow().online);
            if online {
                me.disconnected.set(false);
                me.events.emit(&PeerEvent::Open(me.id()));
            } else {
                me.events.emit(&PeerEvent::Error(PeerError::new(
                    PeerErrorKind::Network,
                    "Lost connection to server.",
                )));
            }
        });
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        info!("loopback: destroying '{}'", self.id());
        self.open.set(false);
        self.disconnected.set(true);
        if let Some(state) = self.broker.upgrade() {
            let id = self.id();
            let mut state = state.borrow_mut();
            let mine = state
                .registered
                .get(&id)
                .map_or(false, |p| std::ptr::eq(p.as_ptr(), self.me.as_ptr()));
            if mine {
                state.registered.remove(&id);
            }
        }
        let data_links = std::mem::take(&mut *self.data_links.borrow_mut());
        for link in data_links {
            link.close();
        }
        let media_links = std::mem::take(&mut *self.media_links.borrow_mut());
        for link in media_links {
            link.close();
        }
        if let Some(me) = self.me.upgrade() {
            enqueue(&self.broker, move || {
                me.events.emit(&PeerEvent::Close);
            });
        }
    }

    fn events(&self) -> &Emitter<PeerEvent> {
        &self.events
    }
}

/// One end of an in-memory data channel.
pub struct LoopbackDataLink {
    me: Weak<LoopbackDataLink>,
    broker: BrokerRef,
    peer: String,
    metadata: Metadata,
    label: Option<String>,
    open: Cell<bool>,
    closed: Cell<bool>,
    partner: RefCell<Weak<LoopbackDataLink>>,
    events: Emitter<DataEvent>,
}

impl LoopbackDataLink {
    fn new(broker: &BrokerRef, peer: &str, metadata: Metadata, label: Option<String>) -> Rc<LoopbackDataLink> {
        Rc::new_cyclic(|me| LoopbackDataLink {
            me: me.clone(),
            broker: broker.clone(),
            peer: peer.to_string(),
            metadata,
            label,
            open: Cell::new(false),
            closed: Cell::new(false),
            partner: RefCell::new(Weak::new()),
            events: Emitter::new(),
        })
    }

    fn pair(a: &Rc<LoopbackDataLink>, b: &Rc<LoopbackDataLink>) {
        *a.partner.borrow_mut() = Rc::downgrade(b);
        *b.partner.borrow_mut() = Rc::downgrade(a);
    }

    fn mark_open(&self) {
        if self.closed.get() {
            return;
        }
        self.open.set(true);
        self.events.emit(&DataEvent::Open);
    }

    fn receive(&self, data: Value) {
        if self.open.get() {
            self.events.emit(&DataEvent::Data(data));
        }
    }

    fn shut(&self, notify_partner: bool) {
        if self.closed.replace(true) {
            return;
        }
        self.open.set(false);
        if let Some(me) = self.me.upgrade() {
            enqueue(&self.broker, move || {
                me.events.emit(&DataEvent::Close);
            });
        }
        if notify_partner {
            let partner = self.partner.borrow().upgrade();
            if let Some(partner) = partner {
                partner.shut(false);
            }
        }
    }

    /// queue a transport error on this end only
    pub fn fail(&self, message: &str) {
        if let Some(me) = self.me.upgrade() {
            let message = message.to_string();
            enqueue(&self.broker, move || {
                me.events.emit(&DataEvent::Error(message));
            });
        }
    }
}

impl DataLink for LoopbackDataLink {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn label(&self) -> Option<String> {
        self.label.clone()
    }

    fn send(&self, data: &Value) -> Result<(), BoxError> {
        if !self.open.get() {
            bail!("connection to {} is not open", self.peer);
        }
        let partner = self.partner.borrow().upgrade();
        match partner {
            Some(partner) => {
                let data = data.clone();
                enqueue(&self.broker, move || partner.receive(data));
                Ok(())
            }
            None => bail!("connection to {} has no remote end", self.peer),
        }
    }

    fn close(&self) {
        self.shut(true);
    }

    fn events(&self) -> &Emitter<DataEvent> {
        &self.events
    }
}

/// One end of an in-memory call.
pub struct LoopbackMediaLink {
    me: Weak<LoopbackMediaLink>,
    broker: BrokerRef,
    peer: String,
    metadata: Metadata,
    local_stream: RefCell<Option<MediaStream>>,
    open: Cell<bool>,
    closed: Cell<bool>,
    partner: RefCell<Weak<LoopbackMediaLink>>,
    events: Emitter<MediaEvent>,
}

impl LoopbackMediaLink {
    fn new(
        broker: &BrokerRef,
        peer: &str,
        metadata: Metadata,
        local_stream: Option<MediaStream>,
    ) -> Rc<LoopbackMediaLink> {
        Rc::new_cyclic(|me| LoopbackMediaLink {
            me: me.clone(),
            broker: broker.clone(),
            peer: peer.to_string(),
            metadata,
            local_stream: RefCell::new(local_stream),
            open: Cell::new(false),
            closed: Cell::new(false),
            partner: RefCell::new(Weak::new()),
            events: Emitter::new(),
        })
    }

    fn pair(a: &Rc<LoopbackMediaLink>, b: &Rc<LoopbackMediaLink>) {
        *a.partner.borrow_mut() = Rc::downgrade(b);
        *b.partner.borrow_mut() = Rc::downgrade(a);
    }

    fn shut(&self, notify_partner: bool) {
        if self.closed.replace(true) {
            return;
        }
        self.open.set(false);
        if let Some(me) = self.me.upgrade() {
            enqueue(&self.broker, move || {
                me.events.emit(&MediaEvent::Close);
            });
        }
        if notify_partner {
            let partner = self.partner.borrow().upgrade();
            if let Some(partner) = partner {
                partner.shut(false);
            }
        }
    }

    /// queue a transport error on this end only
    pub fn fail(&self, message: &str) {
        if let Some(me) = self.me.upgrade() {
            let message = message.to_string();
            enqueue(&self.broker, move || {
                me.events.emit(&MediaEvent::Error(message));
            });
        }
    }
}

impl MediaLink for LoopbackMediaLink {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn answer(&self, stream: &MediaStream) {
        if self.closed.get() || self.open.get() {
            return;
        }
        let partner = match self.partner.borrow().upgrade() {
            Some(p) => p,
            None => {
                warn!("loopback: answering a call from {} that is gone", self.peer);
                return;
            }
        };
        *self.local_stream.borrow_mut() = Some(stream.clone());
        self.open.set(true);
        partner.open.set(true);
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        enqueue(&self.broker, move || {
            // each side gets the stream the other one sent
            let theirs = partner.local_stream.borrow().clone();
            let ours = me.local_stream.borrow().clone();
            if let Some(s) = theirs {
                if !me.closed.get() {
                    me.events.emit(&MediaEvent::Stream(s));
                }
            }
            if let Some(s) = ours {
                if !partner.closed.get() {
                    partner.events.emit(&MediaEvent::Stream(s));
                }
            }
        });
    }

    fn close(&self) {
        self.shut(true);
    }

    fn events(&self) -> &Emitter<MediaEvent> {
        &self.events
    }
}

/// Capture devices that hand out synthetic streams.
#[derive(Debug, Clone)]
pub struct LoopbackDevices {
    pub supported: bool,
    pub permission_granted: bool,
    captured: Cell<u32>,
}

impl LoopbackDevices {
    pub fn new() -> LoopbackDevices {
        LoopbackDevices {
            supported: true,
            permission_granted: true,
            captured: Cell::new(0),
        }
    }
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        LoopbackDevices::new()
    }
}

impl MediaDevices for LoopbackDevices {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, BoxError> {
        Ok(vec![
            DeviceInfo {
                id: "loopback-mic".to_string(),
                kind: DeviceKind::AudioInput,
                label: "Loopback Microphone".to_string(),
            },
            DeviceInfo {
                id: "loopback-cam".to_string(),
                kind: DeviceKind::VideoInput,
                label: "Loopback Camera".to_string(),
            },
        ])
    }

    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, BoxError> {
        if !self.permission_granted {
            bail!("Permission denied");
        }
        let n = self.captured.get() + 1;
        self.captured.set(n);
        Ok(MediaStream::new(
            &format!("loopback-capture-{}", n),
            constraints.audio.is_some(),
            constraints.video.is_some(),
        ))
    }
}
