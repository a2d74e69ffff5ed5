//! Every data link the local player has, in either direction.
//!
//! Links we open go in through [`ConnectionRegistry::connect_to_peer`], links others
//! open to us arrive through the session's incoming connection event.  A link leaves
//! either because the owner removes it (the registry closes it) or because the
//! transport reports close (the registry just forgets it).  In both cases the registry
//! stops listening to the link before anything else happens.
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::connection_state::{ConnectionState, ConnectionWatch};
use super::peer_session::{PeerSession, SessionEvent, SessionEventKind};
use super::transport::{same_link, ConnectOptions, DataEvent, DataEventKind, DataLink, MediaLink, MediaStream, Metadata};
use crate::common::emitter::{Emitter, EventKind, Subscription};

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(String),
    Removed(String),
    /// payload received on any registered link
    Data { peer: String, data: Value },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegistryEventKind {
    Added,
    Removed,
    Data,
}

impl EventKind for RegistryEvent {
    type Kind = RegistryEventKind;
    fn kind(&self) -> RegistryEventKind {
        match self {
            RegistryEvent::Added(_) => RegistryEventKind::Added,
            RegistryEvent::Removed(_) => RegistryEventKind::Removed,
            RegistryEvent::Data { .. } => RegistryEventKind::Data,
        }
    }
}

/// One row of the connection list a UI would render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub peer_id: String,
    /// display name the other side put in the metadata
    pub name: Option<String>,
    pub label: Option<String>,
    pub is_open: bool,
    pub error: Option<String>,
    pub last_data: Option<Value>,
}

impl fmt::Display for ConnectionView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ peer: {}, name: {}, open: {} }}",
            self.peer_id,
            self.name.as_deref().unwrap_or("-"),
            self.is_open
        )
    }
}

struct Entry {
    watch: ConnectionWatch,
    _forward: Subscription,
}

struct RegistryCore {
    session: PeerSession,
    entries: RefCell<Vec<Entry>>,
    events: Emitter<RegistryEvent>,
    incoming: RefCell<Option<Subscription>>,
}

/// Cheap to clone, clones share one list.
#[derive(Clone)]
pub struct ConnectionRegistry {
    core: Rc<RegistryCore>,
}

impl ConnectionRegistry {
    pub fn new(session: &PeerSession) -> ConnectionRegistry {
        let core = Rc::new(RegistryCore {
            session: session.clone(),
            entries: RefCell::new(vec![]),
            events: Emitter::new(),
            incoming: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let sub = session
            .events()
            .subscribe(SessionEventKind::IncomingConnection, move |e| {
                if let (Some(core), SessionEvent::IncomingConnection(link)) = (weak.upgrade(), e) {
                    core.track(link.clone());
                }
            });
        *core.incoming.borrow_mut() = Some(sub);
        ConnectionRegistry { core }
    }

    /// Open a link to `target`.  None when there is no target, the session is not open
    /// or its peer has lost the broker.
    pub fn connect_to_peer(&self, target: &str, metadata: Metadata, label: Option<&str>) -> Option<Rc<dyn DataLink>> {
        if target.is_empty() {
            debug!("connect_to_peer: no target");
            return None;
        }
        if !self.core.session.is_open() {
            warn!("connect_to_peer: session not open, not connecting to {}", target);
            return None;
        }
        let peer = self.core.session.peer()?;
        if peer.is_disconnected() {
            warn!("connect_to_peer: peer disconnected, not connecting to {}", target);
            return None;
        }
        info!("connecting to {}", target);
        let link = peer.connect(
            target,
            ConnectOptions {
                metadata,
                label: label.map(String::from),
            },
        );
        self.core.track(link.clone());
        Some(link)
    }

    /// Stop listening to `link`, close it and forget it.  Unknown links are ignored.
    pub fn remove_connection(&self, link: &Rc<dyn DataLink>) {
        if let Some(entry) = self.core.take(link) {
            let peer = entry.watch.link().peer();
            let link = entry.watch.link().clone();
            drop(entry);
            link.close();
            info!("removed connection to {}", peer);
            self.core.events.emit(&RegistryEvent::Removed(peer));
        }
    }

    pub fn remove_all(&self) {
        for link in self.connections() {
            self.remove_connection(&link);
        }
    }

    /// Send `data` on every registered link.  Returns how many links accepted it; links
    /// that refuse (not open yet, gone) are logged and left alone.
    pub fn send_data<T: Serialize>(&self, data: &T) -> usize {
        let value = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("send_data: cannot serialize payload: {}", e);
                return 0;
            }
        };
        let mut accepted = 0;
        for link in self.connections() {
            match link.send(&value) {
                Ok(()) => accepted += 1,
                Err(e) => debug!("send_data: {} refused: {}", link.peer(), e),
            }
        }
        accepted
    }

    /// Call the other end of `link` with `stream`, carrying the link's metadata.
    pub fn call_peer(&self, link: &Rc<dyn DataLink>, stream: Option<&MediaStream>) -> Option<Rc<dyn MediaLink>> {
        let stream = stream?;
        if !link.is_open() {
            debug!("call_peer: connection to {} not open yet", link.peer());
            return None;
        }
        let peer = self.core.session.peer()?;
        info!("calling {}", link.peer());
        Some(peer.call(&link.peer(), stream, link.metadata()))
    }

    pub fn connections(&self) -> Vec<Rc<dyn DataLink>> {
        self.core
            .entries
            .borrow()
            .iter()
            .map(|e| e.watch.link().clone())
            .collect()
    }

    pub fn connection_state(&self, link: &Rc<dyn DataLink>) -> Option<ConnectionState> {
        self.core
            .entries
            .borrow()
            .iter()
            .find(|e| same_link(e.watch.link(), link))
            .map(|e| e.watch.state())
    }

    pub fn snapshot(&self) -> Vec<ConnectionView> {
        self.core
            .entries
            .borrow()
            .iter()
            .map(|e| {
                let link = e.watch.link();
                let state = e.watch.state();
                ConnectionView {
                    peer_id: link.peer(),
                    name: link.metadata().get("name").and_then(Value::as_str).map(String::from),
                    label: link.label(),
                    is_open: state.is_open,
                    error: state.error,
                    last_data: state.data,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.core.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> &Emitter<RegistryEvent> {
        &self.core.events
    }
}

impl RegistryCore {
    fn track(self: &Rc<Self>, link: Rc<dyn DataLink>) {
        if self.entries.borrow().iter().any(|e| same_link(e.watch.link(), &link)) {
            return;
        }
        let peer = link.peer();
        let weak = Rc::downgrade(self);
        let forward_peer = peer.clone();
        let forward = link.events().subscribe(DataEventKind::Data, move |e| {
            if let (Some(core), DataEvent::Data(data)) = (weak.upgrade(), e) {
                core.events.emit(&RegistryEvent::Data {
                    peer: forward_peer.clone(),
                    data: data.clone(),
                });
            }
        });
        let weak = Rc::downgrade(self);
        let closing = Rc::downgrade(&link);
        let watch = ConnectionWatch::new(link, move || {
            if let (Some(core), Some(link)) = (weak.upgrade(), closing.upgrade()) {
                core.forget(&link);
            }
        });
        self.entries.borrow_mut().push(Entry {
            watch,
            _forward: forward,
        });
        debug!("tracking connection to {}", peer);
        self.events.emit(&RegistryEvent::Added(peer));
    }

    fn take(&self, link: &Rc<dyn DataLink>) -> Option<Entry> {
        let mut entries = self.entries.borrow_mut();
        let idx = entries.iter().position(|e| same_link(e.watch.link(), link))?;
        Some(entries.remove(idx))
    }

    /// the transport closed `link` itself
    fn forget(&self, link: &Rc<dyn DataLink>) {
        if let Some(entry) = self.take(link) {
            let peer = entry.watch.link().peer();
            drop(entry);
            info!("connection to {} went away", peer);
            self.events.emit(&RegistryEvent::Removed(peer));
        }
    }
}
