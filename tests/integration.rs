//! End-to-end scenarios driving `XsmpClient` over a real socket pair,
//! exercising the protocol codec, the property store, and the save
//! codec together instead of through `Server`'s poll loop (kept
//! in-process, unlike the teacher's subprocess-spawning `tests/`
//! style, per this crate's own conventions).

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use xsmpd::client::{Client, EndSessionFlags, SessionClient};
use xsmpd::codec::{AutostartDirs, SaveOutcome};
use xsmpd::property::{names, Property};
use xsmpd::protocol::{
    InboundMessage, InteractKind, InteractStyle, OutboundMessage, ReadEvent, SaveType, Transport,
    WireProperty,
};
use xsmpd::sigbus::SignalBus;

/// Stands in for the peer side of the socket: a bare XSMP client that
/// writes `InboundMessage`s and reads `OutboundMessage`s using the
/// same length-prefixed bincode framing `FramedConnection` uses
/// internally.
struct TestPeer {
    stream: UnixStream,
}

impl TestPeer {
    fn send(&mut self, msg: InboundMessage) {
        let payload = bincode::serialize(&msg).unwrap();
        self.stream.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        self.stream.write_all(&payload).unwrap();
    }

    /// Non-blocking attempt to read one reply frame; returns `None` if
    /// nothing has arrived yet.
    fn try_recv(&mut self) -> Option<OutboundMessage> {
        let len = match self.stream.read_u32::<LittleEndian>() {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(e) => panic!("reading reply length prefix: {:?}", e),
        };
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf).unwrap();
        Some(bincode::deserialize(&buf).unwrap())
    }
}

fn new_pair() -> (Client, TestPeer) {
    let (engine_side, peer_side) = UnixStream::pair().unwrap();
    engine_side.set_nonblocking(true).unwrap();
    peer_side.set_nonblocking(true).unwrap();
    let conn = xsmpd::protocol::FramedConnection::new(Box::new(engine_side) as Box<dyn Transport>);
    let client = Client::new_xsmp("/org/gnome/SessionManager/Client1".to_string(), conn);
    (client, TestPeer { stream: peer_side })
}

fn bus_with_id(id: &str) -> SignalBus {
    let id = id.to_string();
    let mut bus = SignalBus::new();
    bus.on_register_request(move |_prev_id| Some(id.clone()));
    bus
}

fn pump(client: &mut Client, bus: &mut SignalBus) {
    let xc = client.as_xsmp_mut();
    loop {
        match xc.try_read() {
            Ok(ReadEvent::Pending) => break,
            Ok(event) => {
                let was_message = matches!(event, ReadEvent::Message(_));
                xc.handle_read_event(event, bus);
                if !was_message {
                    break;
                }
            }
            Err(_) => {
                xc.handle_transport_error(bus);
                break;
            }
        }
    }
}

fn to_wire(p: Property) -> WireProperty {
    (&p).into()
}

#[test]
fn fresh_client_gets_a_local_checkpoint_on_registration() {
    let (mut client, mut peer) = new_pair();
    let mut bus = bus_with_id("startup-1");

    peer.send(InboundMessage::RegisterClient { prev_id: String::new() });
    pump(&mut client, &mut bus);

    assert_eq!(client.startup_id(), "startup-1");
    let mut replies = Vec::new();
    while let Some(reply) = peer.try_recv() {
        replies.push(reply);
    }
    assert!(matches!(replies[0], OutboundMessage::RegisterClientReply { .. }));
    assert!(matches!(replies[1], OutboundMessage::SaveYourself { save_type: SaveType::Local, .. }));
}

#[test]
fn logout_request_coalesces_shutdown_and_global() {
    let (mut client, mut peer) = new_pair();
    let mut bus = bus_with_id("startup-2");
    let logout_seen = Rc::new(RefCell::new(false));
    let seen = logout_seen.clone();
    bus.on_logout_request(move |_show_dialog| *seen.borrow_mut() = true);

    peer.send(InboundMessage::RegisterClient { prev_id: "resume".to_string() });
    pump(&mut client, &mut bus);

    peer.send(InboundMessage::SaveYourselfRequest {
        save_type: SaveType::Both,
        shutdown: true,
        interact_style: InteractStyle::None,
        fast: false,
        global: true,
    });
    pump(&mut client, &mut bus);

    assert!(*logout_seen.borrow());
}

#[test]
fn interact_request_blocks_and_then_resolves() {
    let (mut client, mut peer) = new_pair();
    let mut bus = bus_with_id("startup-3");
    let blocking_reason = Rc::new(RefCell::new(None));
    let captured = blocking_reason.clone();
    bus.on_end_session_response(move |_path, response| {
        if !response.is_ok {
            *captured.borrow_mut() = response.reason.clone();
        }
    });

    peer.send(InboundMessage::RegisterClient { prev_id: "resume".to_string() });
    pump(&mut client, &mut bus);

    client.query_end_session(EndSessionFlags::default(), &mut bus).unwrap();

    peer.send(InboundMessage::InteractRequest { kind: InteractKind::Dialog });
    pump(&mut client, &mut bus);

    assert!(blocking_reason.borrow().is_some());

    peer.send(InboundMessage::InteractDone { cancel_shutdown: false });
    pump(&mut client, &mut bus);
}

#[test]
fn transport_drop_is_silent_cleanup_not_a_status_change() {
    let (mut client, peer) = new_pair();
    let mut bus = bus_with_id("startup-4");
    {
        let mut peer = peer;
        peer.send(InboundMessage::RegisterClient { prev_id: "resume".to_string() });
        pump(&mut client, &mut bus);

        let disconnected = Rc::new(RefCell::new(false));
        let seen = disconnected.clone();
        bus.on_disconnected(move |_| *seen.borrow_mut() = true);

        drop(peer);
        pump(&mut client, &mut bus);

        assert!(!*disconnected.borrow(), "graceful transport close must not fire disconnected");
    }
}

#[test]
fn save_with_no_restart_command_is_skipped() {
    let (mut client, mut peer) = new_pair();
    let mut bus = bus_with_id("startup-5");
    peer.send(InboundMessage::RegisterClient { prev_id: "resume".to_string() });
    pump(&mut client, &mut bus);

    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_CONFIG_HOME", dir.path());
    let dirs = AutostartDirs::from_env();
    let outcome = client.save(&dirs).unwrap();
    assert_eq!(outcome, SaveOutcome::Skipped);
}

#[test]
fn end_session_with_save_flag_saves_to_autostart() {
    let (mut client, mut peer) = new_pair();
    let mut bus = bus_with_id("startup-6");
    peer.send(InboundMessage::RegisterClient { prev_id: "resume".to_string() });
    pump(&mut client, &mut bus);

    peer.send(InboundMessage::SetProperties {
        props: vec![
            to_wire(Property::list_of_byte_string(names::PROGRAM, vec![b"myapp".to_vec()])),
            to_wire(Property::list_of_byte_string(
                names::RESTART_COMMAND,
                vec![b"myapp".to_vec(), b"--resume".to_vec()],
            )),
        ],
    });
    pump(&mut client, &mut bus);

    client.end_session(EndSessionFlags { save: true, ..Default::default() }, &mut bus).unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_CONFIG_HOME", dir.path());
    let dirs = AutostartDirs::from_env();
    let outcome = client.save(&dirs).unwrap();
    match outcome {
        SaveOutcome::Written(path) => {
            let contents = std::fs::read_to_string(path).unwrap();
            assert!(contents.contains("Exec=myapp --resume"));
        }
        other => panic!("expected Written, got {:?}", other),
    }
}
