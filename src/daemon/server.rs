//! The cooperative, single-threaded XSMP event loop (spec §5: "the
//! client state machine itself must never be touched from more than
//! one thread at a time").
//!
//! Grounded on the teacher's `daemon/server.rs` accept loop, but
//! reshaped from "accept, then spawn a thread per connection" into
//! "accept, then register the fd with a `nix::poll` set and dispatch
//! readiness events on this one thread". Anything that needs to enter
//! the engine from another thread (the `dbus_surface` tokio runtime)
//! does so by sending a [`Command`] down a `crossbeam_channel`
//! instead of calling in directly.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use nix::poll::{PollFd, PollFlags};
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientError, EndSessionFlags, RestartStyleHint, SessionClient, Status};
use crate::codec::AutostartDirs;
use crate::consts;
use crate::protocol::{FramedConnection, ReadEvent, Transport};
use crate::registry::Registry;
use crate::sigbus::{EndSessionResponse, SignalBus};
use crate::test_hooks;

/// A snapshot of one client's state, handed back across the command
/// channel to the D-Bus adaptor (spec §4.4 getters).
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub path: String,
    pub startup_id: String,
    pub app_id: String,
    pub app_name: String,
    pub restart_style_hint: RestartStyleHint,
    pub unix_process_id: u32,
    pub status: Status,
}

/// Requests the D-Bus control surface sends into the engine thread
/// (spec §4.4). Every variant that can fail carries its own one-shot
/// reply channel so the adaptor can await exactly its own answer.
pub enum Command {
    Stop { path: String, reply: Sender<Result<(), ClientError>> },
    QueryEndSession { path: String, flags: EndSessionFlags, reply: Sender<Result<(), ClientError>> },
    EndSession { path: String, flags: EndSessionFlags, reply: Sender<Result<(), ClientError>> },
    CancelEndSession { path: String, reply: Sender<Result<(), ClientError>> },
    GetInfo { path: String, reply: Sender<Option<ClientInfo>> },
    ListClients { reply: Sender<Vec<String>> },
}

/// Signals the engine thread emits outward, for the D-Bus adaptor to
/// relay onto the bus (spec §4.2.4, §6).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ClientRegistered { path: String },
    Disconnected { path: String },
    EndSessionResponse { path: String, response: EndSessionResponseSnapshot },
    LogoutRequest { show_dialog: bool },
}

#[derive(Debug, Clone)]
pub struct EndSessionResponseSnapshot {
    pub is_ok: bool,
    pub do_last: bool,
    pub cancel: bool,
    pub reason: Option<String>,
}

impl From<&EndSessionResponse> for EndSessionResponseSnapshot {
    fn from(r: &EndSessionResponse) -> Self {
        EndSessionResponseSnapshot { is_ok: r.is_ok, do_last: r.do_last, cancel: r.cancel, reason: r.reason.clone() }
    }
}

fn client_info(path: &str, client: &Client) -> ClientInfo {
    ClientInfo {
        path: path.to_string(),
        startup_id: client.startup_id().to_string(),
        app_id: client.app_id().to_string(),
        app_name: client.get_app_name(),
        restart_style_hint: client.get_restart_style_hint(),
        unix_process_id: client.get_unix_process_id(),
        status: client.status(),
    }
}

pub struct Server {
    registry: Registry,
    bus: SignalBus,
    autostart_dirs: AutostartDirs,
    commands: Receiver<Command>,
    events: Sender<EngineEvent>,
}

impl Server {
    /// `autostart_dir_override` is the daemon config's `autostart_dir`
    /// setting, if any, searched ahead of the `$XDG_CONFIG_HOME`
    /// default (spec §A).
    pub fn new(commands: Receiver<Command>, events: Sender<EngineEvent>, autostart_dir_override: Option<&str>) -> Self {
        let mut bus = SignalBus::new();
        let mut next_serial = 0u64;
        bus.on_register_request(move |prev_id| {
            if !prev_id.is_empty() {
                return Some(prev_id.to_string());
            }
            next_serial += 1;
            Some(format!("{}-{}", std::process::id(), next_serial))
        });

        Server {
            registry: Registry::new(),
            bus,
            autostart_dirs: AutostartDirs::from_config(autostart_dir_override),
            commands,
            events,
        }
    }

    /// Drives the event loop until the listener is closed. `listener`
    /// must already be in non-blocking mode.
    pub fn serve(mut self, listener: UnixListener) -> anyhow::Result<()> {
        listener.set_nonblocking(true).context("setting listener non-blocking")?;
        info!("listening on socket");
        test_hooks::emit!("daemon-about-to-listen");

        loop {
            self.drain_commands();
            self.reap_finished_clients();

            let mut fds: Vec<PollFd> = vec![PollFd::new(
                listener.as_raw_fd(),
                PollFlags::POLLIN,
            )];
            let mut polled_paths: Vec<String> = Vec::new();
            for (path, client) in self.registry.iter() {
                if let Some(fd) = client_raw_fd(client) {
                    fds.push(PollFd::new(fd, PollFlags::POLLIN));
                    polled_paths.push(path.clone());
                }
            }

            let poll_timeout_ms = consts::SOCK_STREAM_TIMEOUT.as_millis() as i32;
            let n = nix::poll::poll(&mut fds, poll_timeout_ms).context("polling client fds")?;
            if n == 0 {
                continue;
            }

            if let Some(revents) = fds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    self.accept_new_clients(&listener);
                }
            }

            for (fd_slot, path) in fds[1..].iter().zip(polled_paths.iter()) {
                let revents = match fd_slot.revents() {
                    Some(r) => r,
                    None => continue,
                };
                if revents.is_empty() {
                    continue;
                }
                if let Some(client) = self.registry.lookup_mut(path) {
                    pump_client(client, &mut self.bus);
                }
            }
        }
    }

    fn accept_new_clients(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        error!("failed to set accepted stream non-blocking: {:?}", e);
                        continue;
                    }
                    let path = self.registry.insert(|path| new_xsmp_client(path, stream));
                    debug!(path = %path, "accepted new XSMP connection");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accepting connection: {:?}", e);
                    break;
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_command(cmd);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Stop { path, reply } => {
                let result = match self.registry.lookup_mut(&path) {
                    Some(c) => c.stop(&mut self.bus),
                    None => Err(ClientError::NotRegistered),
                };
                let _ = reply.send(result);
            }
            Command::QueryEndSession { path, flags, reply } => {
                let result = match self.registry.lookup_mut(&path) {
                    Some(c) => c.query_end_session(flags, &mut self.bus),
                    None => Err(ClientError::NotRegistered),
                };
                let _ = reply.send(result);
            }
            Command::EndSession { path, flags, reply } => {
                let result = match self.registry.lookup_mut(&path) {
                    Some(c) => c.end_session(flags, &mut self.bus),
                    None => Err(ClientError::NotRegistered),
                };
                let _ = reply.send(result);
            }
            Command::CancelEndSession { path, reply } => {
                let result = match self.registry.lookup_mut(&path) {
                    Some(c) => c.cancel_end_session(&mut self.bus),
                    None => Err(ClientError::NotRegistered),
                };
                let _ = reply.send(result);
            }
            Command::GetInfo { path, reply } => {
                let info = self.registry.lookup(&path).map(|c| client_info(&path, c));
                let _ = reply.send(info);
            }
            Command::ListClients { reply } => {
                let paths: Vec<String> = self.registry.iter().map(|(p, _)| p.clone()).collect();
                let _ = reply.send(paths);
            }
        }
    }

    fn reap_finished_clients(&mut self) {
        let finished: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, c)| c.is_finished())
            .map(|(p, _)| p.clone())
            .collect();
        for path in finished {
            if let Some(c) = self.registry.lookup(&path) {
                if let Err(e) = c.save(&self.autostart_dirs) {
                    warn!(path = %path, "saving client state on exit: {}", e);
                }
            }
            self.registry.remove(&path);
        }
    }

}

/// Wires the bus's fan-out signals directly to the outbound event
/// channel. Split from `new` because it needs to move a clone of
/// `events` into each closure.
pub fn with_relays(mut server: Server) -> Server {
    let events = server.events.clone();
    server.bus.on_client_registered(move |path| {
        let _ = events.send(EngineEvent::ClientRegistered { path: path.to_string() });
    });
    let events = server.events.clone();
    server.bus.on_disconnected(move |path| {
        let _ = events.send(EngineEvent::Disconnected { path: path.to_string() });
    });
    let events = server.events.clone();
    server.bus.on_end_session_response(move |path, response| {
        let _ = events.send(EngineEvent::EndSessionResponse {
            path: path.to_string(),
            response: response.into(),
        });
    });
    let events = server.events.clone();
    server.bus.on_logout_request(move |show_dialog| {
        let _ = events.send(EngineEvent::LogoutRequest { show_dialog });
    });
    server
}

fn new_xsmp_client(path: String, stream: UnixStream) -> Client {
    let conn = FramedConnection::new(Box::new(stream) as Box<dyn Transport>);
    Client::new_xsmp(path, conn)
}

fn client_raw_fd(client: &Client) -> Option<RawFd> {
    let xc = client.as_xsmp();
    if !xc.has_connection() {
        return None;
    }
    xc.raw_fd()
}

fn pump_client(client: &mut Client, bus: &mut SignalBus) {
    let xc = client.as_xsmp_mut();
    loop {
        if xc.raw_fd().is_none() {
            break;
        }
        match xc.try_read() {
            Ok(ReadEvent::Pending) => break,
            Ok(event) => xc.handle_read_event(event, bus),
            Err(_) => {
                xc.handle_transport_error(bus);
                break;
            }
        }
        if !xc.has_connection() {
            break;
        }
    }
}
