//! Event emitter with scoped subscriptions.
//!
//! Transport objects (peers, data links, media links) and the components built on them
//! publish their events through an [`Emitter`].  Subscribing hands back a
//! [`Subscription`] guard; the handler stays registered exactly as long as the guard
//! lives.  Components keep their guards next to the state they update and drop them on
//! teardown, so a destroyed peer can never call back into a component that has moved on.
//!
//! Everything here is single threaded (`Rc`/`RefCell`).  No borrow of the listener list
//! is held while handlers run, so a handler may subscribe, unsubscribe or emit on other
//! emitters.
use log::warn;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Events carry a plain discriminant so handlers can subscribe to one kind at a time.
pub trait EventKind {
    type Kind: Copy + PartialEq + fmt::Debug;
    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Rc<RefCell<dyn FnMut(&E)>>;

struct Listener<E: EventKind> {
    id: u64,
    kind: E::Kind,
    handler: Handler<E>,
}

struct Listeners<E: EventKind> {
    next_id: u64,
    list: Vec<Listener<E>>,
}

pub struct Emitter<E: EventKind> {
    listeners: Rc<RefCell<Listeners<E>>>,
}

impl<E: EventKind> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Emitter {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E: EventKind + 'static> Default for Emitter<E> {
    fn default() -> Self {
        Emitter::new()
    }
}

impl<E: EventKind + 'static> Emitter<E> {
    pub fn new() -> Emitter<E> {
        Emitter {
            listeners: Rc::new(RefCell::new(Listeners {
                next_id: 0,
                list: vec![],
            })),
        }
    }

    /// register `handler` for events of `kind`.  Dropping the returned guard unregisters it.
    pub fn subscribe(&self, kind: E::Kind, handler: impl FnMut(&E) + 'static) -> Subscription {
        let handler: Handler<E> = Rc::new(RefCell::new(handler));
        let id = {
            let mut listeners = self.listeners.borrow_mut();
            listeners.next_id += 1;
            let id = listeners.next_id;
            listeners.list.push(Listener { id, kind, handler });
            id
        };
        let weak = Rc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.borrow_mut().list.retain(|l| l.id != id);
            }
        })
    }

    /// deliver `event` to every handler registered for its kind.  Returns how many ran.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler<E>)> = self
            .listeners
            .borrow()
            .list
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| (l.id, l.handler.clone()))
            .collect();
        let mut called = 0;
        for (id, handler) in snapshot {
            // an earlier handler may have released this one
            if !self.is_registered(id) {
                continue;
            }
            match handler.try_borrow_mut() {
                Ok(mut h) => {
                    (&mut *h)(event);
                    called += 1;
                }
                Err(_) => warn!("emitter: re-entrant {:?} event skipped", kind),
            }
        }
        called
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().list.len()
    }

    fn is_registered(&self, id: u64) -> bool {
        self.listeners.borrow().list.iter().any(|l| l.id == id)
    }
}

/// Guard for one registered handler.  Released on drop or by [`Subscription::cancel`].
#[must_use = "dropping a Subscription unregisters the handler"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + 'static) -> Subscription {
        Subscription {
            release: Some(Box::new(release)),
        }
    }
    pub fn cancel(mut self) {
        self.release_now();
    }
    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Subscription {{ live: {} }}", self.release.is_some())
    }
}
