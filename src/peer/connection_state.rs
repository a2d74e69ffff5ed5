//! Live view of one data link: the last payload, whether it is open, the last error.
//!
//! A [`ConnectionWatch`] subscribes to the link's events and keeps a
//! [`ConnectionState`] current.  When the link reports close the watch unsubscribes
//! itself first and then runs the owner's close callback, so the callback can drop the
//! watch (and the link) without any handler of this link running again.
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

use super::transport::{DataEvent, DataEventKind, DataLink};
use crate::common::emitter::Subscription;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub data: Option<Value>,
    pub is_open: bool,
    pub error: Option<String>,
}

pub struct ConnectionWatch {
    link: Rc<dyn DataLink>,
    state: Rc<RefCell<ConnectionState>>,
    subscriptions: Rc<RefCell<Vec<Subscription>>>,
}

impl ConnectionWatch {
    pub fn new(link: Rc<dyn DataLink>, on_close: impl FnOnce() + 'static) -> ConnectionWatch {
        let state = Rc::new(RefCell::new(ConnectionState {
            is_open: link.is_open(),
            ..ConnectionState::default()
        }));
        let subscriptions = Rc::new(RefCell::new(Vec::with_capacity(4)));
        let events = link.events();
        let mut subs = Vec::with_capacity(4);

        let st = state.clone();
        subs.push(events.subscribe(DataEventKind::Open, move |_| {
            let mut st = st.borrow_mut();
            st.is_open = true;
            st.error = None;
        }));
        let st = state.clone();
        subs.push(events.subscribe(DataEventKind::Data, move |e| {
            if let DataEvent::Data(value) = e {
                st.borrow_mut().data = Some(value.clone());
            }
        }));
        let st = state.clone();
        let peer = link.peer();
        subs.push(events.subscribe(DataEventKind::Error, move |e| {
            if let DataEvent::Error(msg) = e {
                debug!("connection to {} reported: {}", peer, msg);
                st.borrow_mut().error = Some(msg.clone());
            }
        }));
        let st = state.clone();
        let own_subs = Rc::downgrade(&subscriptions);
        let peer = link.peer();
        let mut on_close = Some(on_close);
        subs.push(events.subscribe(DataEventKind::Close, move |_| {
            info!("connection to {} closed", peer);
            st.borrow_mut().is_open = false;
            if let Some(own) = own_subs.upgrade() {
                let released = std::mem::take(&mut *own.borrow_mut());
                drop(released);
            }
            if let Some(callback) = on_close.take() {
                callback();
            }
        }));

        *subscriptions.borrow_mut() = subs;
        ConnectionWatch {
            link,
            state,
            subscriptions,
        }
    }

    pub fn link(&self) -> &Rc<dyn DataLink> {
        &self.link
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_watching(&self) -> bool {
        !self.subscriptions.borrow().is_empty()
    }

    /// stop listening without running the close callback
    pub fn release(&self) {
        let released = std::mem::take(&mut *self.subscriptions.borrow_mut());
        drop(released);
    }
}
