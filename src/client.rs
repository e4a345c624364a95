//! The XSMP client state machine (spec §4.2) and the `Client` sum type
//! it lives behind (spec §9 Design Notes: "model `Client` as a sum type
//! `{ Xsmp(XsmpClient), ... }` with a small capability trait").

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::codec::{self, AutostartDirs, SaveOutcome};
use crate::property::{names, Property, PropertySet, PropertyType};
use crate::protocol::{
    FramedConnection, InboundMessage, InteractStyle, OutboundMessage, ReadEvent, SaveType,
    Transport,
};
use crate::quote;
use crate::sigbus::{EndSessionResponse, SignalBus};

/// Status states (spec §4.2.1). Monotonic: a client that reaches
/// `Finished` or `Failed` never returns to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unregistered,
    Registered,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStyleHint {
    IfRunning,
    Anyway,
    Immediately,
    Never,
}

/// `end_session`/`query_end_session` flag bits (spec §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct EndSessionFlags {
    pub forceful: bool,
    pub save: bool,
    pub last: bool,
}

impl EndSessionFlags {
    pub fn from_bits(bits: u32) -> Self {
        EndSessionFlags {
            forceful: bits & 0b001 != 0,
            save: bits & 0b010 != 0,
            last: bits & 0b100 != 0,
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    NotRegistered,
    General(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotRegistered => write!(f, "client is not registered"),
            ClientError::General(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Debug, Clone, Copy)]
struct PendingSaveYourself {
    save_type: SaveType,
    allow_interact: bool,
}

/// The capability trait every client kind implements (spec §9). There
/// is only one concrete kind today (`XsmpClient`), but the trait keeps
/// the control-surface adaptor and the registry from caring.
pub trait SessionClient {
    fn path(&self) -> &str;
    fn status(&self) -> Status;
    fn startup_id(&self) -> &str;
    fn app_id(&self) -> &str;
    fn get_restart_style_hint(&self) -> RestartStyleHint;
    fn get_unix_process_id(&self) -> u32;
    fn get_app_name(&self) -> String;
    fn stop(&mut self, bus: &mut SignalBus) -> Result<(), ClientError>;
    fn query_end_session(&mut self, flags: EndSessionFlags, bus: &mut SignalBus) -> Result<(), ClientError>;
    fn end_session(&mut self, flags: EndSessionFlags, bus: &mut SignalBus) -> Result<(), ClientError>;
    fn cancel_end_session(&mut self, bus: &mut SignalBus) -> Result<(), ClientError>;
    fn save(&self, dirs: &AutostartDirs) -> Result<SaveOutcome, ClientError>;
}

/// The concrete, and currently only, client kind.
pub enum Client {
    Xsmp(XsmpClient),
}

impl Client {
    pub fn new_xsmp(path: String, conn: FramedConnection<Box<dyn Transport>>) -> Self {
        Client::Xsmp(XsmpClient::new(path, conn))
    }

    pub fn as_xsmp_mut(&mut self) -> &mut XsmpClient {
        match self {
            Client::Xsmp(c) => c,
        }
    }

    pub fn as_xsmp(&self) -> &XsmpClient {
        match self {
            Client::Xsmp(c) => c,
        }
    }

    /// True once this client can be dropped from the registry: it has
    /// reached a terminal status (spec §3 Lifecycle).
    pub fn is_finished(&self) -> bool {
        matches!(self.as_xsmp().status, Status::Finished | Status::Failed)
    }
}

impl SessionClient for Client {
    fn path(&self) -> &str {
        self.as_xsmp().path.as_str()
    }
    fn status(&self) -> Status {
        self.as_xsmp().status
    }
    fn startup_id(&self) -> &str {
        self.as_xsmp().startup_id.as_str()
    }
    fn app_id(&self) -> &str {
        self.as_xsmp().app_id.as_str()
    }
    fn get_restart_style_hint(&self) -> RestartStyleHint {
        self.as_xsmp().get_restart_style_hint()
    }
    fn get_unix_process_id(&self) -> u32 {
        self.as_xsmp().get_unix_process_id()
    }
    fn get_app_name(&self) -> String {
        self.as_xsmp().get_app_name()
    }
    fn stop(&mut self, bus: &mut SignalBus) -> Result<(), ClientError> {
        self.as_xsmp_mut().stop(bus)
    }
    fn query_end_session(&mut self, flags: EndSessionFlags, bus: &mut SignalBus) -> Result<(), ClientError> {
        self.as_xsmp_mut().query_end_session(flags, bus)
    }
    fn end_session(&mut self, flags: EndSessionFlags, bus: &mut SignalBus) -> Result<(), ClientError> {
        self.as_xsmp_mut().end_session(flags, bus)
    }
    fn cancel_end_session(&mut self, bus: &mut SignalBus) -> Result<(), ClientError> {
        self.as_xsmp_mut().cancel_end_session(bus)
    }
    fn save(&self, dirs: &AutostartDirs) -> Result<SaveOutcome, ClientError> {
        self.as_xsmp().save(dirs)
    }
}

/// The XSMP protocol engine for one connection (spec §4.2).
pub struct XsmpClient {
    path: String,
    startup_id: String,
    app_id: String,
    status: Status,
    properties: PropertySet,
    description: String,
    conn: Option<FramedConnection<Box<dyn Transport>>>,
    current_save_yourself: Option<SaveType>,
    pending_save_yourself: Option<PendingSaveYourself>,
}

impl XsmpClient {
    pub fn new(path: String, conn: FramedConnection<Box<dyn Transport>>) -> Self {
        let description = path.clone();
        XsmpClient {
            path,
            startup_id: String::new(),
            app_id: String::new(),
            status: Status::Unregistered,
            properties: PropertySet::new(),
            description,
            conn: Some(conn),
            current_save_yourself: None,
            pending_save_yourself: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn startup_id(&self) -> &str {
        &self.startup_id
    }

    /// diagnostic label, recomputed on connect and on `SmProgram` change
    /// (spec §4.2.7). Not exposed externally.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn current_save_yourself(&self) -> Option<SaveType> {
        self.current_save_yourself
    }

    pub fn has_pending_save_yourself(&self) -> bool {
        self.pending_save_yourself.is_some()
    }

    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Set by the daemon when it matches this client against an
    /// autostart desktop entry; not derived by the state machine
    /// itself (spec §4.2.6 `get_app_id`/`set_app_id`).
    pub fn set_app_id(&mut self, app_id: String) {
        self.app_id = app_id;
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|c| c.as_raw_fd())
    }

    /// Pulls at most one frame from the transport without blocking.
    /// Thin wrapper so the event loop doesn't need to reach into the
    /// private `conn` field.
    pub fn try_read(&mut self) -> io::Result<ReadEvent> {
        match self.conn.as_mut() {
            Some(conn) => conn.try_read_message(),
            None => Ok(ReadEvent::Eof),
        }
    }

    fn recompute_description(&mut self) {
        let program = self.properties.get(names::PROGRAM).and_then(|p| p.first_as_str());
        self.description = match program {
            Some(p) if !p.is_empty() => format!("{} [{} {}]", self.path, p, self.startup_id),
            _ if !self.startup_id.is_empty() => format!("{} [{}]", self.path, self.startup_id),
            _ => self.path.clone(),
        };
    }

    /// Sends a frame to the peer. A write failure is a terminal
    /// transport error (spec §4.2.3/§7): the client moves to `Failed`
    /// and `disconnected` fires.
    fn send(&mut self, bus: &mut SignalBus, msg: OutboundMessage) {
        let failed = match self.conn.as_mut() {
            Some(conn) => conn.write_message(&msg).is_err(),
            None => true,
        };
        if failed {
            self.fail(bus);
        }
    }

    fn fail(&mut self, bus: &mut SignalBus) {
        if self.status != Status::Finished && self.status != Status::Failed {
            self.status = Status::Failed;
            self.conn = None;
            bus.fire_disconnected(&self.path);
        }
    }

    /// Dispatches one inbound frame (spec §4.2.3).
    pub fn handle_inbound(&mut self, msg: InboundMessage, bus: &mut SignalBus) {
        match msg {
            InboundMessage::RegisterClient { prev_id } => self.handle_register_client(prev_id, bus),
            InboundMessage::SetProperties { props } => {
                let mut program_changed = false;
                for wp in props {
                    let prop: Property = wp.into();
                    if prop.name == names::PROGRAM {
                        program_changed = true;
                    }
                    self.properties.delete(&prop.name);
                    self.properties.set(prop);
                }
                if program_changed {
                    self.recompute_description();
                }
            }
            InboundMessage::DeleteProperties { names: names_to_delete } => {
                let mut program_changed = false;
                for n in names_to_delete {
                    if n == names::PROGRAM {
                        program_changed = true;
                    }
                    self.properties.delete(&n);
                }
                if program_changed {
                    self.recompute_description();
                }
            }
            InboundMessage::GetProperties => {
                let props = self.properties.iter().map(|p| p.into()).collect();
                self.send(bus, OutboundMessage::PropertiesReply { props });
            }
            InboundMessage::SaveYourselfRequest { shutdown, global, fast, .. } => {
                match (shutdown, global) {
                    (true, true) => bus.fire_logout_request(!fast),
                    (false, false) => self.do_save_yourself(SaveType::Local, true, bus),
                    _ => tracing::debug!(
                        client = %self.description,
                        "ignoring nonsensical SaveYourselfRequest(shutdown={}, global={})",
                        shutdown, global
                    ),
                }
            }
            InboundMessage::SaveYourselfPhase2Request => {
                if self.current_save_yourself.is_some() {
                    self.send(bus, OutboundMessage::SaveYourselfPhase2);
                    bus.fire_end_session_response(
                        &self.path,
                        EndSessionResponse { is_ok: true, do_last: true, cancel: false, reason: None },
                    );
                }
            }
            InboundMessage::InteractRequest { .. } => {
                bus.fire_end_session_response(
                    &self.path,
                    EndSessionResponse {
                        is_ok: false,
                        do_last: false,
                        cancel: false,
                        reason: Some("This program is blocking logout.".to_string()),
                    },
                );
                self.send(bus, OutboundMessage::Interact);
            }
            InboundMessage::InteractDone { cancel_shutdown } => {
                bus.fire_end_session_response(
                    &self.path,
                    EndSessionResponse { is_ok: true, do_last: false, cancel: cancel_shutdown, reason: None },
                );
            }
            InboundMessage::SaveYourselfDone { .. } => {
                if self.current_save_yourself.is_some() {
                    self.send(bus, OutboundMessage::SaveComplete);
                    self.current_save_yourself = None;
                }
                bus.fire_end_session_response(
                    &self.path,
                    EndSessionResponse { is_ok: true, do_last: false, cancel: false, reason: None },
                );
                if let Some(pending) = self.pending_save_yourself.take() {
                    self.do_save_yourself(pending.save_type, pending.allow_interact, bus);
                }
            }
            InboundMessage::CloseConnection { reasons } => {
                tracing::info!(client = %self.description, ?reasons, "client closed connection");
                self.status = Status::Finished;
                self.conn = None;
                bus.fire_disconnected(&self.path);
            }
        }
    }

    /// Call when the transport signals readiness but yields no message
    /// (spec §4.2.3's "Transport I/O error" and "Transport graceful
    /// close" rows).
    pub fn handle_read_event(&mut self, event: ReadEvent, bus: &mut SignalBus) {
        match event {
            ReadEvent::Message(msg) => self.handle_inbound(msg, bus),
            ReadEvent::Pending => {}
            ReadEvent::Eof => {
                // transport-level graceful close: just stop watching the fd,
                // no status change and no signal (spec §4.2.3)
                self.conn = None;
            }
        }
    }

    /// Transport I/O error observed by the event loop outside of a read
    /// attempt (e.g. a failed write, or a poll error on the fd).
    pub fn handle_transport_error(&mut self, bus: &mut SignalBus) {
        self.fail(bus);
    }

    fn handle_register_client(&mut self, prev_id: String, bus: &mut SignalBus) {
        if self.status != Status::Unregistered {
            tracing::debug!(client = %self.description, "RegisterClient while already registered, ignoring");
            return;
        }
        match bus.fire_register_request(&prev_id) {
            Some(id) if !id.is_empty() => {
                self.startup_id = id.clone();
                self.recompute_description();
                self.send(bus, OutboundMessage::RegisterClientReply { id });
                self.status = Status::Registered;
                bus.fire_client_registered(&self.path);
                if prev_id.is_empty() {
                    self.current_save_yourself = Some(SaveType::Local);
                    self.send(
                        bus,
                        OutboundMessage::SaveYourself {
                            save_type: SaveType::Local,
                            shutdown: false,
                            interact_style: InteractStyle::None,
                            fast: false,
                        },
                    );
                }
            }
            _ => {
                tracing::debug!(client = %self.description, "register-request rejected, remaining unregistered");
            }
        }
    }

    /// Outbound SaveYourself routine (spec §4.2.5).
    fn do_save_yourself(&mut self, save_type: SaveType, allow_interact: bool, bus: &mut SignalBus) {
        if self.pending_save_yourself.is_some() {
            return; // redundant, drop it
        }
        if self.current_save_yourself.is_some() {
            self.pending_save_yourself = Some(PendingSaveYourself { save_type, allow_interact });
            return;
        }
        self.current_save_yourself = Some(save_type);
        self.pending_save_yourself = None;
        let msg = if save_type == SaveType::Local {
            OutboundMessage::SaveYourself {
                save_type: SaveType::Local,
                shutdown: false,
                interact_style: InteractStyle::None,
                fast: false,
            }
        } else if !allow_interact {
            OutboundMessage::SaveYourself { save_type, shutdown: true, interact_style: InteractStyle::None, fast: true }
        } else {
            OutboundMessage::SaveYourself { save_type, shutdown: true, interact_style: InteractStyle::Any, fast: false }
        };
        self.send(bus, msg);
    }

    fn get_restart_style_hint(&self) -> RestartStyleHint {
        match self.properties.get(names::RESTART_STYLE_HINT) {
            Some(p) if p.ty == PropertyType::Byte => {
                match p.values.first().and_then(|v| v.first()).copied() {
                    Some(0) => RestartStyleHint::IfRunning,
                    Some(1) => RestartStyleHint::Anyway,
                    Some(2) => RestartStyleHint::Immediately,
                    Some(3) => RestartStyleHint::Never,
                    _ => RestartStyleHint::IfRunning,
                }
            }
            _ => RestartStyleHint::IfRunning,
        }
    }

    /// `ProcessID` is an `ARRAY8` holding a decimal string; malformed or
    /// overflowing values default to 0 (spec §4.2.6, §8 boundary cases).
    fn get_unix_process_id(&self) -> u32 {
        self.properties
            .get(names::PROCESS_ID)
            .and_then(|p| p.first_as_str())
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0)
    }

    fn get_app_name(&self) -> String {
        match self.properties.get(names::PROGRAM) {
            Some(p) => quote::command_string(&p.values),
            None => String::new(),
        }
    }

    fn stop(&mut self, bus: &mut SignalBus) -> Result<(), ClientError> {
        if self.status != Status::Registered {
            return Err(ClientError::NotRegistered);
        }
        self.send(bus, OutboundMessage::Die);
        Ok(())
    }

    /// §4.2.6 `QueryEndSession`: like `end_session` but never finalizes
    /// (the `last` bit doesn't apply to a query), so only `forceful`
    /// and `save` are honored.
    fn query_end_session(&mut self, flags: EndSessionFlags, bus: &mut SignalBus) -> Result<(), ClientError> {
        if self.status != Status::Registered {
            return Err(ClientError::NotRegistered);
        }
        let save_type = if flags.save { SaveType::Both } else { SaveType::Global };
        self.do_save_yourself(save_type, !flags.forceful, bus);
        Ok(())
    }

    fn end_session(&mut self, flags: EndSessionFlags, bus: &mut SignalBus) -> Result<(), ClientError> {
        if self.status != Status::Registered {
            return Err(ClientError::NotRegistered);
        }
        if flags.last {
            self.send(bus, OutboundMessage::SaveYourselfPhase2);
        } else {
            let save_type = if flags.save { SaveType::Both } else { SaveType::Global };
            self.do_save_yourself(save_type, false, bus);
        }
        Ok(())
    }

    fn cancel_end_session(&mut self, bus: &mut SignalBus) -> Result<(), ClientError> {
        if self.status != Status::Registered {
            return Err(ClientError::NotRegistered);
        }
        self.send(bus, OutboundMessage::ShutdownCancelled);
        self.current_save_yourself = None;
        self.pending_save_yourself = None;
        Ok(())
    }

    fn save(&self, dirs: &AutostartDirs) -> Result<SaveOutcome, ClientError> {
        codec::save(&self.properties, &self.startup_id, dirs).map_err(|e| ClientError::General(e.to_string()))
    }
}

/// Construction helpers for tests elsewhere in the crate that need a
/// `Client` without a real socket pair.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};

    struct NullTransport;
    impl io::Read for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }
    impl io::Write for NullTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl AsRawFd for NullTransport {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    pub fn dummy_xsmp_client(path: String) -> Client {
        let conn = FramedConnection::new(Box::new(NullTransport) as Box<dyn Transport>);
        Client::new_xsmp(path, conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigbus::SignalBus;

    fn new_client() -> Client {
        test_support::dummy_xsmp_client("/org/gnome/SessionManager/Client1".to_string())
    }

    #[test]
    fn register_then_checkpoint_then_done_clears_state() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        bus.on_register_request(|_prev_id| Some("c1".to_string()));

        xc.handle_inbound(InboundMessage::RegisterClient { prev_id: String::new() }, &mut bus);
        assert_eq!(xc.status(), Status::Registered);
        assert_eq!(xc.startup_id(), "c1");
        assert_eq!(xc.current_save_yourself(), Some(SaveType::Local));

        xc.handle_inbound(InboundMessage::SaveYourselfDone { success: true }, &mut bus);
        assert_eq!(xc.current_save_yourself(), None);
        assert!(!xc.has_pending_save_yourself());
    }

    #[test]
    fn cancel_end_session_clears_current_and_pending() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        bus.on_register_request(|_| Some("c1".to_string()));
        xc.handle_inbound(InboundMessage::RegisterClient { prev_id: "x".to_string() }, &mut bus);

        xc.query_end_session(EndSessionFlags::default(), &mut bus).unwrap();
        xc.end_session(EndSessionFlags { save: true, ..Default::default() }, &mut bus).unwrap();
        assert!(xc.current_save_yourself().is_some());
        assert!(xc.has_pending_save_yourself());

        xc.cancel_end_session(&mut bus).unwrap();
        assert!(xc.current_save_yourself().is_none());
        assert!(!xc.has_pending_save_yourself());
    }

    #[test]
    fn current_save_yourself_blocks_a_second_send() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        bus.on_register_request(|_| Some("c1".to_string()));
        xc.handle_inbound(InboundMessage::RegisterClient { prev_id: "x".to_string() }, &mut bus);

        xc.query_end_session(EndSessionFlags::default(), &mut bus).unwrap();
        let first = xc.current_save_yourself();
        xc.query_end_session(EndSessionFlags::default(), &mut bus).unwrap();
        // second request queues as pending rather than overwriting current
        assert_eq!(xc.current_save_yourself(), first);
        assert!(xc.has_pending_save_yourself());
    }

    #[test]
    fn disconnected_fires_on_close_connection() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(false));
        let seen2 = seen.clone();
        bus.on_disconnected(move |_path| *seen2.borrow_mut() = true);

        xc.handle_inbound(InboundMessage::CloseConnection { reasons: vec![] }, &mut bus);
        assert_eq!(xc.status(), Status::Finished);
        assert!(*seen.borrow());
    }

    #[test]
    fn stop_before_registration_is_not_registered() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        match xc.stop(&mut bus) {
            Err(ClientError::NotRegistered) => {}
            other => panic!("expected NotRegistered, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn unix_process_id_overflow_and_garbage_default_to_zero() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        bus.on_register_request(|_| Some("c1".to_string()));
        xc.handle_inbound(InboundMessage::RegisterClient { prev_id: "x".to_string() }, &mut bus);

        for (raw, want) in [("4294967296", 0u32), ("12a", 0), ("42", 42)] {
            xc.handle_inbound(
                InboundMessage::SetProperties {
                    props: vec![crate::protocol::WireProperty {
                        name: names::PROCESS_ID.to_string(),
                        ty: crate::protocol::WirePropertyType::ByteString,
                        values: vec![raw.as_bytes().to_vec()],
                    }],
                },
                &mut bus,
            );
            assert_eq!(xc.get_unix_process_id(), want, "input {:?}", raw);
        }
    }

    #[test]
    fn restart_style_hint_defaults_to_if_running() {
        let client = new_client();
        assert_eq!(client.get_restart_style_hint(), RestartStyleHint::IfRunning);
    }

    #[test]
    fn shell_quoted_app_name() {
        let mut client = new_client();
        let xc = client.as_xsmp_mut();
        let mut bus = SignalBus::new();
        bus.on_register_request(|_| Some("c1".to_string()));
        xc.handle_inbound(InboundMessage::RegisterClient { prev_id: "x".to_string() }, &mut bus);
        xc.handle_inbound(
            InboundMessage::SetProperties {
                props: vec![crate::protocol::WireProperty {
                    name: names::PROGRAM.to_string(),
                    ty: crate::protocol::WirePropertyType::ListOfByteString,
                    values: vec![b"my app".to_vec(), b"--file=/tmp/a'b".to_vec()],
                }],
            },
            &mut bus,
        );
        assert_eq!(xc.get_app_name(), r#"'my app' '--file=/tmp/a'\''b'"#);
    }
}
