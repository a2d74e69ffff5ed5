//! Turns media calls into "the remote stream to show right now".
//!
//! A call can come in (offered by the session's incoming call event, then answered
//! with the local stream) or go out (placed on an open data link).  Whichever call is
//! being watched through [`CallStreamBridge::stream_from_connection`] feeds the remote
//! stream: the stream event sets it, close clears it, an error is kept next to it.
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::transport::{same_link, DataLink, MediaEvent, MediaEventKind, MediaLink, MediaStream};
use crate::common::emitter::Subscription;

/// Snapshot of the bridge for a UI.
#[derive(Debug, Clone, Default)]
pub struct MediaCallState {
    /// last call offered to us
    pub remote_connection: Option<Rc<dyn MediaLink>>,
    /// call we placed
    pub outgoing_connection: Option<Rc<dyn MediaLink>>,
    pub stream: Option<MediaStream>,
    pub error: Option<String>,
}

#[derive(Default)]
struct BridgeInner {
    offered: Option<Rc<dyn MediaLink>>,
    answered: Option<Rc<dyn MediaLink>>,
    outgoing: Option<Rc<dyn MediaLink>>,
    watched: Option<Rc<dyn MediaLink>>,
    stream: Option<MediaStream>,
    error: Option<String>,
    subscriptions: Vec<Subscription>,
}

/// Cheap to clone, clones share state.
#[derive(Clone, Default)]
pub struct CallStreamBridge {
    inner: Rc<RefCell<BridgeInner>>,
}

impl CallStreamBridge {
    pub fn new() -> CallStreamBridge {
        CallStreamBridge::default()
    }

    /// remember an incoming call until it is answered
    pub fn offer(&self, call: Rc<dyn MediaLink>) {
        info!("call offered by {}", call.peer());
        self.inner.borrow_mut().offered = Some(call);
    }

    /// Answer `incoming` with `local`.  Nothing happens unless both are present.
    pub fn answer_remote(
        &self,
        incoming: Option<&Rc<dyn MediaLink>>,
        local: Option<&MediaStream>,
    ) -> Option<Rc<dyn MediaLink>> {
        let (call, stream) = match (incoming, local) {
            (Some(call), Some(stream)) => (call, stream),
            _ => {
                debug!("answer_remote: need both an incoming call and a local stream");
                return None;
            }
        };
        info!("answering call from {} with {}", call.peer(), stream.id);
        call.answer(stream);
        let previous = self.inner.borrow_mut().answered.replace(call.clone());
        hang_up_replaced(previous, call);
        Some(call.clone())
    }

    /// Place a call over `link` with `local` using `call_fn`, normally
    /// [`super::connection_registry::ConnectionRegistry::call_peer`].
    pub fn call_remote<F>(
        &self,
        local: Option<&MediaStream>,
        link: Option<&Rc<dyn DataLink>>,
        call_fn: F,
    ) -> Option<Rc<dyn MediaLink>>
    where
        F: FnOnce(&Rc<dyn DataLink>, &MediaStream) -> Option<Rc<dyn MediaLink>>,
    {
        let (stream, link) = match (local, link) {
            (Some(stream), Some(link)) => (stream, link),
            _ => return None,
        };
        let outgoing = call_fn(link, stream);
        if outgoing.is_none() {
            debug!("call_remote: call to {} not placed", link.peer());
        }
        let previous = std::mem::replace(&mut self.inner.borrow_mut().outgoing, outgoing.clone());
        match (previous, &outgoing) {
            (Some(previous), Some(call)) => hang_up_replaced(Some(previous), call),
            // a failed attempt drops the old call too
            (Some(previous), None) => previous.close(),
            _ => {}
        }
        outgoing
    }

    /// Watch `call` for its remote stream.  Switching calls drops the handlers on the
    /// previous one; passing the call already watched changes nothing.
    pub fn stream_from_connection(&self, call: Option<&Rc<dyn MediaLink>>) -> (Option<MediaStream>, Option<String>) {
        let unchanged = match (&self.inner.borrow().watched, call) {
            (Some(current), Some(call)) => same_link(current, call),
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            let old = {
                let mut inner = self.inner.borrow_mut();
                inner.watched = call.cloned();
                inner.stream = None;
                inner.error = None;
                std::mem::take(&mut inner.subscriptions)
            };
            drop(old);
            if let Some(call) = call {
                let subscriptions = self.watch(call);
                self.inner.borrow_mut().subscriptions = subscriptions;
            }
        }
        (self.remote_stream(), self.stream_error())
    }

    fn watch(&self, call: &Rc<dyn MediaLink>) -> Vec<Subscription> {
        let events = call.events();
        let mut subs = Vec::with_capacity(3);
        let weak: Weak<RefCell<BridgeInner>> = Rc::downgrade(&self.inner);
        subs.push(events.subscribe(MediaEventKind::Stream, move |e| {
            if let (Some(inner), MediaEvent::Stream(stream)) = (weak.upgrade(), e) {
                info!("remote stream {} arrived", stream.id);
                inner.borrow_mut().stream = Some(stream.clone());
            }
        }));
        let weak = Rc::downgrade(&self.inner);
        subs.push(events.subscribe(MediaEventKind::Close, move |_| {
            if let Some(inner) = weak.upgrade() {
                info!("remote stream ended");
                inner.borrow_mut().stream = None;
            }
        }));
        let weak = Rc::downgrade(&self.inner);
        subs.push(events.subscribe(MediaEventKind::Error, move |e| {
            if let (Some(inner), MediaEvent::Error(msg)) = (weak.upgrade(), e) {
                warn!("call error: {}", msg);
                inner.borrow_mut().error = Some(msg.clone());
            }
        }));
        subs
    }

    /// the call whose stream should be shown: the one we placed, else the one we answered
    pub fn active_call(&self) -> Option<Rc<dyn MediaLink>> {
        let inner = self.inner.borrow();
        inner.outgoing.clone().or_else(|| inner.answered.clone())
    }

    /// keep watching whatever [`CallStreamBridge::active_call`] says
    pub fn refresh(&self) -> (Option<MediaStream>, Option<String>) {
        let active = self.active_call();
        self.stream_from_connection(active.as_ref())
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.borrow().stream.clone()
    }

    pub fn stream_error(&self) -> Option<String> {
        self.inner.borrow().error.clone()
    }

    pub fn state(&self) -> MediaCallState {
        let inner = self.inner.borrow();
        MediaCallState {
            remote_connection: inner.offered.clone(),
            outgoing_connection: inner.outgoing.clone(),
            stream: inner.stream.clone(),
            error: inner.error.clone(),
        }
    }

    /// close every call and forget them
    pub fn hang_up(&self) {
        let calls = {
            let mut inner = std::mem::take(&mut *self.inner.borrow_mut());
            inner.subscriptions.clear();
            [inner.offered.take(), inner.answered.take(), inner.outgoing.take()]
        };
        for call in calls.into_iter().flatten() {
            call.close();
        }
    }
}

/// one call per direction: close the one `current` takes over from
fn hang_up_replaced(previous: Option<Rc<dyn MediaLink>>, current: &Rc<dyn MediaLink>) {
    if let Some(previous) = previous {
        if !same_link(&previous, current) {
            info!("closing call with {}, replaced by {}", previous.peer(), current.peer());
            previous.close();
        }
    }
}

#[cfg(test)]
mod test_call_bridge {
    use super::*;
    use crate::common::emitter::Emitter;
    use crate::peer::transport::{DataEvent, Metadata};
    use serde_json::Value;
    use std::cell::Cell;

    struct StubCall {
        answered_with: RefCell<Option<MediaStream>>,
        closed: Cell<bool>,
        events: Emitter<MediaEvent>,
    }

    impl MediaLink for StubCall {
        fn peer(&self) -> String {
            "bob".to_string()
        }
        fn metadata(&self) -> Metadata {
            Value::Null
        }
        fn is_open(&self) -> bool {
            self.answered_with.borrow().is_some()
        }
        fn answer(&self, stream: &MediaStream) {
            *self.answered_with.borrow_mut() = Some(stream.clone());
        }
        fn close(&self) {
            self.closed.set(true);
        }
        fn events(&self) -> &Emitter<MediaEvent> {
            &self.events
        }
    }

    fn stub() -> Rc<StubCall> {
        Rc::new(StubCall {
            answered_with: RefCell::new(None),
            closed: Cell::new(false),
            events: Emitter::new(),
        })
    }

    #[test]
    fn answer_needs_both() {
        let bridge = CallStreamBridge::new();
        let call = stub();
        let as_link: Rc<dyn MediaLink> = call.clone();
        let local = MediaStream::new("local", true, true);
        assert!(bridge.answer_remote(None, Some(&local)).is_none());
        assert!(bridge.answer_remote(Some(&as_link), None).is_none());
        assert!(call.answered_with.borrow().is_none());
        let answered = bridge.answer_remote(Some(&as_link), Some(&local)).unwrap();
        assert!(same_link(&answered, &as_link));
        assert_eq!(*call.answered_with.borrow(), Some(local));
        assert!(same_link(&bridge.active_call().unwrap(), &as_link));
    }

    #[test]
    fn call_remote_needs_both() {
        let bridge = CallStreamBridge::new();
        let local = MediaStream::new("local", true, false);
        let called = Cell::new(0);
        let result = bridge.call_remote(Some(&local), None, |_, _| {
            called.set(called.get() + 1);
            None
        });
        assert!(result.is_none());
        assert_eq!(called.get(), 0);
    }

    #[test]
    fn stream_follows_events() {
        let bridge = CallStreamBridge::new();
        let call = stub();
        let as_link: Rc<dyn MediaLink> = call.clone();
        assert_eq!(bridge.stream_from_connection(None), (None, None));
        bridge.stream_from_connection(Some(&as_link));
        assert_eq!(call.events.listener_count(), 3);

        let remote = MediaStream::new("remote", true, true);
        call.events.emit(&MediaEvent::Stream(remote.clone()));
        assert_eq!(bridge.remote_stream(), Some(remote.clone()));
        // an error does not drop the stream
        call.events.emit(&MediaEvent::Error("ice".to_string()));
        assert_eq!(
            bridge.stream_from_connection(Some(&as_link)),
            (Some(remote), Some("ice".to_string()))
        );
        // still only one set of handlers
        assert_eq!(call.events.listener_count(), 3);
        call.events.emit(&MediaEvent::Close);
        assert_eq!(bridge.remote_stream(), None);
        assert_eq!(bridge.stream_error(), Some("ice".to_string()));
    }

    #[test]
    fn switching_calls_drops_old_handlers() {
        let bridge = CallStreamBridge::new();
        let first = stub();
        let second = stub();
        let first_link: Rc<dyn MediaLink> = first.clone();
        let second_link: Rc<dyn MediaLink> = second.clone();
        bridge.stream_from_connection(Some(&first_link));
        first.events.emit(&MediaEvent::Stream(MediaStream::new("one", true, false)));
        bridge.stream_from_connection(Some(&second_link));
        assert_eq!(first.events.listener_count(), 0);
        assert_eq!(bridge.remote_stream(), None);
        first.events.emit(&MediaEvent::Stream(MediaStream::new("late", true, false)));
        assert_eq!(bridge.remote_stream(), None);
        second.events.emit(&MediaEvent::Stream(MediaStream::new("two", true, false)));
        assert_eq!(bridge.remote_stream().unwrap().id, "two");
        bridge.stream_from_connection(None);
        assert_eq!(second.events.listener_count(), 0);
    }

    #[test]
    fn second_answer_closes_the_first() {
        let bridge = CallStreamBridge::new();
        let first = stub();
        let second = stub();
        let first_link: Rc<dyn MediaLink> = first.clone();
        let second_link: Rc<dyn MediaLink> = second.clone();
        let local = MediaStream::new("local", true, true);
        bridge.answer_remote(Some(&first_link), Some(&local));
        // answering the same call again keeps it
        bridge.answer_remote(Some(&first_link), Some(&local));
        assert!(!first.closed.get());
        bridge.answer_remote(Some(&second_link), Some(&local));
        assert!(first.closed.get());
        assert!(!second.closed.get());
        assert!(same_link(&bridge.active_call().unwrap(), &second_link));

        bridge.hang_up();
        assert!(second.closed.get());
        assert!(bridge.active_call().is_none());
    }

    #[test]
    fn outgoing_wins_and_hang_up_closes() {
        let bridge = CallStreamBridge::new();
        let incoming = stub();
        let outgoing = stub();
        let incoming_link: Rc<dyn MediaLink> = incoming.clone();
        let outgoing_link: Rc<dyn MediaLink> = outgoing.clone();
        bridge.offer(incoming_link.clone());
        assert!(bridge.active_call().is_none());
        assert!(same_link(&bridge.state().remote_connection.unwrap(), &incoming_link));
        let local = MediaStream::new("local", true, true);
        bridge.answer_remote(Some(&incoming_link), Some(&local));

        struct NoLink {
            events: Emitter<DataEvent>,
        }
        impl DataLink for NoLink {
            fn peer(&self) -> String {
                "bob".to_string()
            }
            fn is_open(&self) -> bool {
                true
            }
            fn metadata(&self) -> Metadata {
                Value::Null
            }
            fn label(&self) -> Option<String> {
                None
            }
            fn send(&self, _data: &Value) -> Result<(), crate::common::box_error::BoxError> {
                Ok(())
            }
            fn close(&self) {}
            fn events(&self) -> &Emitter<DataEvent> {
                &self.events
            }
        }
        let link: Rc<dyn DataLink> = Rc::new(NoLink { events: Emitter::new() });
        let placed = bridge.call_remote(Some(&local), Some(&link), |_, _| Some(outgoing_link.clone()));
        assert!(placed.is_some());
        assert!(same_link(&bridge.active_call().unwrap(), &outgoing_link));
        bridge.refresh();
        assert_eq!(outgoing.events.listener_count(), 3);

        bridge.hang_up();
        assert!(incoming.closed.get());
        assert!(outgoing.closed.get());
        assert_eq!(outgoing.events.listener_count(), 0);
        assert!(bridge.active_call().is_none());
    }
}
