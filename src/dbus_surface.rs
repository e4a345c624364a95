//! The D-Bus control surface (spec §4.4, §6): one object per client at
//! `/org/gnome/SessionManager/ClientN`, exposing the upward operations
//! and the `Disconnected`/`EndSessionResponse` signals.
//!
//! Grounded on `leonardo-matheus-winux/desktop/winux-notifications/src/daemon.rs`'s
//! `#[interface]` server-object pattern, and the method/signal naming
//! from `other_examples/.../ohsalmeron-xfce-rs/window-session.rs`'s
//! XSMP-over-D-Bus proxy. `zbus` and `tokio` are not in the teacher's
//! own dependency graph; both are pulled from the rest of the pack
//! (see `DESIGN.md`) since nothing in the teacher does D-Bus at all.

use std::sync::Arc;

use crossbeam_channel::{Receiver as SyncReceiver, Sender as SyncSender};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use zbus::{interface, Connection, SignalContext};

use crate::client::{ClientError, EndSessionFlags};
use crate::consts;
use crate::daemon::server::{ClientInfo, Command, EngineEvent};

/// One object, published at a client's XSMP path, forwarding every
/// method call into the engine thread and blocking only on the
/// channel round trip (spec §4.4 notes every operation is effectively
/// synchronous from the caller's point of view).
struct ClientObject {
    path: String,
    commands: SyncSender<Command>,
}

fn not_registered() -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(ClientError::NotRegistered.to_string())
}

fn to_fdo_error(e: ClientError) -> zbus::fdo::Error {
    match e {
        ClientError::NotRegistered => not_registered(),
        ClientError::General(msg) => zbus::fdo::Error::Failed(msg),
    }
}

impl ClientObject {
    fn call<T>(
        &self,
        make: impl FnOnce(SyncSender<Result<T, ClientError>>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self.commands.send(make(reply_tx)).is_err() {
            return Err(ClientError::General("engine thread is gone".to_string()));
        }
        reply_rx
            .recv()
            .unwrap_or_else(|_| Err(ClientError::General("engine thread dropped the reply".to_string())))
    }

    fn info(&self) -> Option<ClientInfo> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self.commands.send(Command::GetInfo { path: self.path.clone(), reply: reply_tx }).is_err() {
            return None;
        }
        reply_rx.recv().ok().flatten()
    }
}

#[interface(name = "org.gnome.SessionManager.ClientPrivate")]
impl ClientObject {
    async fn get_startup_id(&self) -> zbus::fdo::Result<String> {
        self.info().map(|i| i.startup_id).ok_or_else(not_registered)
    }

    async fn get_app_id(&self) -> zbus::fdo::Result<String> {
        self.info().map(|i| i.app_id).ok_or_else(not_registered)
    }

    async fn get_restart_style_hint(&self) -> zbus::fdo::Result<u8> {
        self.info()
            .map(|i| i.restart_style_hint as u8)
            .ok_or_else(not_registered)
    }

    async fn get_unix_process_id(&self) -> zbus::fdo::Result<u32> {
        self.info().map(|i| i.unix_process_id).ok_or_else(not_registered)
    }

    async fn get_app_name(&self) -> zbus::fdo::Result<String> {
        self.info().map(|i| i.app_name).ok_or_else(not_registered)
    }

    async fn get_status(&self) -> zbus::fdo::Result<u8> {
        self.info().map(|i| i.status as u8).ok_or_else(not_registered)
    }

    async fn stop(&self) -> zbus::fdo::Result<()> {
        self.call(|reply| Command::Stop { path: self.path.clone(), reply }).map_err(to_fdo_error)
    }

    async fn query_end_session(&self, flags: u32) -> zbus::fdo::Result<()> {
        self.call(|reply| Command::QueryEndSession {
            path: self.path.clone(),
            flags: EndSessionFlags::from_bits(flags),
            reply,
        })
        .map_err(to_fdo_error)
    }

    async fn end_session(&self, flags: u32) -> zbus::fdo::Result<()> {
        self.call(|reply| Command::EndSession {
            path: self.path.clone(),
            flags: EndSessionFlags::from_bits(flags),
            reply,
        })
        .map_err(to_fdo_error)
    }

    async fn cancel_end_session(&self) -> zbus::fdo::Result<()> {
        self.call(|reply| Command::CancelEndSession { path: self.path.clone(), reply }).map_err(to_fdo_error)
    }

    #[zbus(signal)]
    async fn disconnected(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn end_session_response(
        ctxt: &SignalContext<'_>,
        is_ok: bool,
        do_last: bool,
        cancel: bool,
        reason: &str,
    ) -> zbus::Result<()>;
}

/// Starts the D-Bus surface on its own tokio runtime and drives it
/// until `events` closes. Runs on whatever thread the caller spawns
/// it from; the engine's own event loop stays single-threaded.
pub fn run(
    bus_name: Option<String>,
    commands: SyncSender<Command>,
    events: SyncReceiver<EngineEvent>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move { drive(bus_name, commands, events).await })
}

async fn drive(
    bus_name: Option<String>,
    commands: SyncSender<Command>,
    events: SyncReceiver<EngineEvent>,
) -> anyhow::Result<()> {
    let connection = Connection::session().await?;
    connection.request_name(bus_name.as_deref().unwrap_or(consts::BUS_NAME)).await?;
    info!(name = bus_name.as_deref().unwrap_or(consts::BUS_NAME), "acquired bus name");

    let connection = Arc::new(connection);
    // the crossbeam receiver is bridged onto a tokio channel so the
    // select loop below doesn't block the runtime on a sync recv
    let (tx, mut rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while let Ok(event) = events.recv() {
            if tx.send(event).is_err() {
                break;
            }
        }
    });

    while let Some(event) = rx.recv().await {
        if let Err(e) = handle_event(&connection, &commands, event).await {
            error!("handling engine event: {:?}", e);
        }
    }
    Ok(())
}

async fn handle_event(
    connection: &Connection,
    commands: &SyncSender<Command>,
    event: EngineEvent,
) -> anyhow::Result<()> {
    match event {
        EngineEvent::ClientRegistered { path } => {
            let object = ClientObject { path: path.clone(), commands: commands.clone() };
            connection.object_server().at(path.as_str(), object).await?;
        }
        EngineEvent::Disconnected { path } => {
            let iface_ref = connection
                .object_server()
                .interface::<_, ClientObject>(path.as_str())
                .await;
            if let Ok(iface_ref) = iface_ref {
                ClientObject::disconnected(iface_ref.signal_context()).await?;
            }
            let _: bool = connection.object_server().remove::<ClientObject, _>(path.as_str()).await?;
        }
        EngineEvent::EndSessionResponse { path, response } => {
            let iface_ref = connection.object_server().interface::<_, ClientObject>(path.as_str()).await;
            match iface_ref {
                Ok(iface_ref) => {
                    ClientObject::end_session_response(
                        iface_ref.signal_context(),
                        response.is_ok,
                        response.do_last,
                        response.cancel,
                        response.reason.as_deref().unwrap_or(""),
                    )
                    .await?;
                }
                Err(e) => warn!(path = %path, "no object for end-session-response: {:?}", e),
            }
        }
        EngineEvent::LogoutRequest { show_dialog } => {
            info!(show_dialog, "logout requested");
        }
    }
    Ok(())
}
