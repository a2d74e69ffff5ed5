//! One player in a jam: the identity, the connections, the notes and the video call,
//! wired together.
//!
//! Notes played here go to everybody connected; notes arriving from anybody land in
//! the same active note set as our own.  An incoming call is offered to the bridge and
//! waits there until [`JamClient::answer`].
use log::{debug, info};
use serde_json::{json, Value};
use std::rc::Rc;

use crate::common::{emitter::Subscription, settings::Settings};
use crate::midi::{
    active_notes::ActiveNoteTracker,
    midi_event::{from_device_message, MidiEvent},
};
use crate::peer::{
    call_bridge::CallStreamBridge,
    connection_registry::{ConnectionRegistry, RegistryEvent, RegistryEventKind},
    peer_session::{Clock, PeerIdentity, PeerSession, SessionEvent, SessionEventKind, SessionOptions},
    transport::{MediaLink, MediaStream, PeerFactory},
};

pub struct JamClient {
    settings: Settings,
    session: PeerSession,
    registry: ConnectionRegistry,
    tracker: ActiveNoteTracker,
    bridge: CallStreamBridge,
    room: Option<String>,
    _wiring: Vec<Subscription>,
}

impl JamClient {
    /// `clock` overrides the wall clock the retry timers run on
    pub fn new(settings: Settings, factory: Rc<dyn PeerFactory>, clock: Option<Clock>) -> JamClient {
        let mut options = SessionOptions::from_settings(&settings);
        if let Some(clock) = clock {
            options = options.with_clock(clock);
        }
        let session = PeerSession::new(factory, settings.requested_peer_id(), options);
        let registry = ConnectionRegistry::new(&session);
        let tracker = ActiveNoteTracker::new();
        let bridge = CallStreamBridge::new();

        let mut wiring = vec![];
        let notes = tracker.clone();
        wiring.push(registry.events().subscribe(RegistryEventKind::Data, move |e| {
            if let RegistryEvent::Data { peer, data } = e {
                match serde_json::from_value::<MidiEvent>(data.clone()) {
                    Ok(event) => notes.apply_remote(&event),
                    Err(err) => debug!("dropping payload from {}: {}", peer, err),
                }
            }
        }));
        let calls = bridge.clone();
        wiring.push(session.events().subscribe(SessionEventKind::IncomingCall, move |e| {
            if let SessionEvent::IncomingCall(call) = e {
                calls.offer(call.clone());
            }
        }));

        JamClient {
            settings,
            session,
            registry,
            tracker,
            bridge,
            room: None,
            _wiring: wiring,
        }
    }

    /// register with the broker
    pub fn start(&self) {
        self.session.start();
    }

    /// drive the session timers; call from the main loop
    pub fn poll(&self) {
        self.session.poll();
    }

    /// connect to the player registered as `room`
    pub fn join(&mut self, room: &str) -> bool {
        let metadata = json!({ "name": self.settings.name });
        match self.registry.connect_to_peer(room, metadata, None) {
            Some(_) => {
                info!("joining {}", room);
                self.room = Some(room.to_string());
                true
            }
            None => false,
        }
    }

    pub fn leave(&mut self) {
        info!("leaving {}", self.room.as_deref().unwrap_or("jam"));
        self.bridge.hang_up();
        self.registry.remove_all();
        self.tracker.clear();
        self.room = None;
    }

    /// play a note: show it locally and send it to everybody.  Returns how many
    /// connections took it.
    pub fn play(&self, event: &MidiEvent) -> usize {
        self.tracker.apply_local(event);
        self.registry.send_data(event)
    }

    /// raw bytes from a midi input device, anything but a 3 byte message is ignored
    pub fn device_input(&self, bytes: &[u8]) -> Option<usize> {
        let event = from_device_message(bytes)?;
        Some(self.play(&event))
    }

    /// call the first open connection with our local stream
    pub fn call(&self, local: Option<&MediaStream>) -> Option<Rc<dyn MediaLink>> {
        let link = self.registry.connections().into_iter().find(|l| l.is_open());
        let call = self
            .bridge
            .call_remote(local, link.as_ref(), |link, stream| self.registry.call_peer(link, Some(stream)));
        self.bridge.refresh();
        call
    }

    /// answer the call waiting in the bridge with our local stream
    pub fn answer(&self, local: Option<&MediaStream>) -> Option<Rc<dyn MediaLink>> {
        let offered = self.bridge.state().remote_connection;
        let answered = self.bridge.answer_remote(offered.as_ref(), local);
        self.bridge.refresh();
        answered
    }

    pub fn shutdown(&mut self) {
        self.leave();
        self.session.shutdown();
    }

    pub fn active_notes(&self) -> Vec<u8> {
        self.tracker.active_notes()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.bridge.remote_stream()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.session.identity()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn bridge(&self) -> &CallStreamBridge {
        &self.bridge
    }

    /// everything a status bar shows, as json
    pub fn status(&self) -> Value {
        json!({
            "identity": self.session.identity(),
            "state": self.session.state(),
            "room": self.room,
            "connections": self.registry.snapshot(),
            "activeNotes": self.tracker.active_notes(),
            "remoteStream": self.bridge.remote_stream(),
            "streamError": self.bridge.stream_error(),
        })
    }
}
