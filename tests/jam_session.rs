//! End to end jams over the in-memory broker.
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use play_away::common::micro_timer::MICROS_PER_SEC;
use play_away::midi::active_notes::ActiveNoteTracker;
use play_away::midi::midi_event::MidiEvent;
use play_away::peer::connection_registry::{ConnectionRegistry, RegistryEvent, RegistryEventKind};
use play_away::peer::loopback::LoopbackBroker;
use play_away::peer::peer_error::PeerErrorKind;
use play_away::peer::peer_session::{PeerSession, SessionEvent, SessionEventKind, SessionOptions};
use play_away::peer::transport::{MediaLink, MediaStream};

static LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

/// a player without the client shell: session, registry and a tracker fed by the registry
struct Player {
    session: PeerSession,
    registry: ConnectionRegistry,
    tracker: ActiveNoteTracker,
    _notes: play_away::common::emitter::Subscription,
}

struct Jam {
    broker: LoopbackBroker,
    now: Rc<Cell<u128>>,
}

impl Jam {
    fn new() -> Jam {
        Lazy::force(&LOGGING);
        Jam {
            broker: LoopbackBroker::new(),
            now: Rc::new(Cell::new(0)),
        }
    }

    fn player(&self, name: &str) -> Player {
        let now = self.now.clone();
        let options = SessionOptions::default().with_clock(Rc::new(move || now.get()));
        let session = PeerSession::new(Rc::new(self.broker.clone()), name, options);
        let registry = ConnectionRegistry::new(&session);
        let tracker = ActiveNoteTracker::new();
        let t = tracker.clone();
        let notes = registry.events().subscribe(RegistryEventKind::Data, move |e| {
            if let RegistryEvent::Data { data, .. } = e {
                if let Ok(event) = serde_json::from_value::<MidiEvent>(data.clone()) {
                    t.apply_remote(&event);
                }
            }
        });
        session.start();
        Player {
            session,
            registry,
            tracker,
            _notes: notes,
        }
    }

    fn advance_secs(&self, secs: u128, players: &[&Player]) {
        self.now.set(self.now.get() + secs * MICROS_PER_SEC);
        for p in players {
            p.session.poll();
        }
        self.broker.pump();
    }
}

mod data_exchange {
    use super::*;

    #[test]
    fn test_notes_go_both_ways() {
        // bob joins alice, each side hears what the other plays
        let jam = Jam::new();
        let alice = jam.player("alice");
        let bob = jam.player("bob");
        jam.broker.pump();
        assert_eq!(alice.session.identity().local_id, "alice");

        let outbound = bob.registry.connect_to_peer("alice", json!({"name": "bob"}), None).unwrap();
        jam.broker.pump();
        assert_eq!(alice.registry.len(), 1);
        assert_eq!(bob.registry.len(), 1);
        assert_eq!(alice.registry.snapshot()[0].name.as_deref(), Some("bob"));
        assert!(outbound.is_open());

        alice.tracker.apply_local(&MidiEvent::note_on(60, 100));
        assert_eq!(alice.registry.send_data(&MidiEvent::note_on(60, 100)), 1);
        jam.broker.pump();
        assert_eq!(bob.tracker.active_notes(), vec![60]);

        bob.registry.send_data(&MidiEvent::note_off(60));
        jam.broker.pump();
        // alice had 60 once from her own key, the note off from bob took it out
        assert!(alice.tracker.active_notes().is_empty());
    }

    #[test]
    fn test_broadcast_with_pending_link() {
        // two open and one still opening: all three get an attempt, nobody is dropped
        let jam = Jam::new();
        let alice = jam.player("alice");
        let bob = jam.player("bob");
        let carol = jam.player("carol");
        let dave = jam.player("dave");
        jam.broker.pump();
        alice.registry.connect_to_peer("bob", Value::Null, None).unwrap();
        alice.registry.connect_to_peer("carol", Value::Null, None).unwrap();
        jam.broker.pump();
        alice.registry.connect_to_peer("dave", Value::Null, None).unwrap();

        assert_eq!(alice.registry.send_data(&MidiEvent::note_on(64, 80)), 2);
        assert_eq!(alice.registry.len(), 3);
        jam.broker.pump();
        assert_eq!(bob.tracker.active_notes(), vec![64]);
        assert_eq!(carol.tracker.active_notes(), vec![64]);
        assert!(dave.tracker.active_notes().is_empty());
        assert_eq!(alice.registry.send_data(&MidiEvent::note_off(64)), 3);
    }

    #[test]
    fn test_connect_to_unknown_room() {
        // peer-unavailable lands in last_error and nothing else changes
        let jam = Jam::new();
        let bob = jam.player("bob");
        jam.broker.pump();
        let link = bob.registry.connect_to_peer("nobody", Value::Null, None).unwrap();
        jam.broker.pump();
        assert!(bob.session.is_open());
        assert_eq!(
            bob.session.identity().last_error.map(|e| e.kind),
            Some(PeerErrorKind::Other("peer-unavailable".to_string()))
        );
        assert!(!link.is_open());
        assert_eq!(bob.registry.len(), 1);
        bob.registry.remove_connection(&link);
        assert!(bob.registry.is_empty());
    }
}

mod calls {
    use super::*;

    #[test]
    fn test_call_needs_open_connection() {
        let jam = Jam::new();
        let alice = jam.player("alice");
        let bob = jam.player("bob");
        jam.broker.pump();
        let calls: Rc<RefCell<Vec<Rc<dyn MediaLink>>>> = Rc::new(RefCell::new(vec![]));
        let c = calls.clone();
        let _sub = alice.session.events().subscribe(SessionEventKind::IncomingCall, move |e| {
            if let SessionEvent::IncomingCall(call) = e {
                c.borrow_mut().push(call.clone());
            }
        });
        let stream = MediaStream::new("bob-cam", true, true);
        let link = bob.registry.connect_to_peer("alice", json!({"name": "bob"}), None).unwrap();
        assert!(bob.registry.call_peer(&link, Some(&stream)).is_none());
        jam.broker.pump();
        let outgoing = bob.registry.call_peer(&link, Some(&stream)).unwrap();
        jam.broker.pump();
        assert_eq!(calls.borrow().len(), 1);
        let incoming = calls.borrow()[0].clone();
        assert_eq!(incoming.peer(), "bob");
        assert_eq!(incoming.metadata(), json!({"name": "bob"}));
        incoming.answer(&MediaStream::new("alice-cam", true, false));
        jam.broker.pump();
        assert!(outgoing.is_open());
    }
}

mod recovery {
    use super::*;

    #[test]
    fn test_fatal_error_recreates_once() {
        // network is fatal: destroyed now, recreated after the backoff and not before
        let jam = Jam::new();
        let alice = jam.player("alice");
        jam.broker.pump();
        let first = alice.session.peer().unwrap();
        jam.broker.inject_error("alice", PeerErrorKind::Network, "Lost connection to server.");
        jam.broker.pump();
        assert!(first.is_destroyed());
        assert_eq!(first.events().listener_count(), 0);
        assert!(!alice.session.is_open());
        assert!(jam.broker.peers().is_empty());

        jam.advance_secs(10, &[&alice]);
        assert_eq!(alice.session.identities_created(), 1);
        jam.advance_secs(1, &[&alice]);
        assert_eq!(alice.session.identities_created(), 2);
        assert!(alice.session.is_open());
        assert_eq!(alice.session.identity().last_error, None);
        jam.advance_secs(60, &[&alice]);
        assert_eq!(alice.session.identities_created(), 2);
    }

    #[test]
    fn test_rejoin_after_recreate() {
        // connections die with the identity, a fresh join works on the new one
        let jam = Jam::new();
        let alice = jam.player("alice");
        let bob = jam.player("bob");
        jam.broker.pump();
        bob.registry.connect_to_peer("alice", Value::Null, None).unwrap();
        jam.broker.pump();
        jam.broker.inject_error("alice", PeerErrorKind::ServerError, "boom");
        jam.broker.pump();
        assert!(alice.registry.is_empty());
        assert!(bob.registry.is_empty());

        jam.advance_secs(11, &[&alice, &bob]);
        assert!(alice.session.is_open());
        bob.registry.connect_to_peer("alice", Value::Null, None).unwrap();
        jam.broker.pump();
        assert_eq!(alice.registry.len(), 1);
        bob.registry.send_data(&MidiEvent::note_on(72, 1));
        jam.broker.pump();
        assert_eq!(alice.tracker.active_notes(), vec![72]);
    }

    #[test]
    fn test_outage_keeps_retrying() {
        // while the broker is down every attempt fails and schedules the next one
        let jam = Jam::new();
        let alice = jam.player("alice");
        jam.broker.pump();
        jam.broker.set_online(false);
        jam.broker.inject_error("alice", PeerErrorKind::SocketError, "socket");
        jam.broker.pump();
        jam.advance_secs(11, &[&alice]);
        assert_eq!(alice.session.identities_created(), 2);
        assert!(!alice.session.is_open());
        assert!(alice.session.is_reconnecting());
        jam.broker.set_online(true);
        jam.advance_secs(11, &[&alice]);
        assert!(alice.session.is_open());
        assert_eq!(alice.session.identities_created(), 3);
    }
}

mod teardown {
    use super::*;

    #[test]
    fn test_remove_twice() {
        let jam = Jam::new();
        let alice = jam.player("alice");
        let bob = jam.player("bob");
        jam.broker.pump();
        let link = bob.registry.connect_to_peer("alice", Value::Null, None).unwrap();
        jam.broker.pump();
        bob.registry.remove_connection(&link);
        bob.registry.remove_connection(&link);
        jam.broker.pump();
        assert!(bob.registry.is_empty());
        assert!(alice.registry.is_empty());
    }

    #[test]
    fn test_shutdown_leaves_no_listeners() {
        let jam = Jam::new();
        let alice = jam.player("alice");
        let bob = jam.player("bob");
        jam.broker.pump();
        let link = bob.registry.connect_to_peer("alice", Value::Null, None).unwrap();
        jam.broker.pump();
        let peer = alice.session.peer().unwrap();
        let inbound = alice.registry.connections()[0].clone();
        alice.session.shutdown();
        jam.broker.pump();
        assert_eq!(peer.events().listener_count(), 0);
        assert_eq!(inbound.events().listener_count(), 0);
        assert_eq!(link.events().listener_count(), 0);
        assert!(alice.registry.is_empty());
        assert!(bob.registry.is_empty());
        jam.advance_secs(60, &[&alice]);
        assert!(alice.session.peer().is_none());
    }
}
