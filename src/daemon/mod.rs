//! Process wiring: load config, bind the XSMP listener, spawn the
//! D-Bus surface and the signal handler, then drive the engine's
//! event loop on this thread (spec §5, §A).
//!
//! Grounded on the teacher's `src/daemon/mod.rs`: same load-config,
//! bind-listener, construct-server, spawn-signal-handler, serve shape.
//! The teacher's systemd socket-activation branch is dropped; nothing
//! in scope calls for it (see `SPEC_FULL.md` §B).

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use tracing::info;

pub mod config;
mod os_signals;
pub mod server;

use config::Config;
use server::{Command, EngineEvent};

pub fn run(config: Config, socket: PathBuf) -> anyhow::Result<()> {
    info!("starting daemon");

    let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
    let (event_tx, event_rx) = crossbeam_channel::unbounded::<EngineEvent>();

    let bus_name = config.bus_name.clone();
    thread::spawn(move || {
        if let Err(e) = crate::dbus_surface::run(bus_name, command_tx, event_rx) {
            tracing::error!("D-Bus surface exited: {:?}", e);
        }
    });

    let listener = UnixListener::bind(&socket).context("binding to socket")?;
    os_signals::Handler::new(Some(socket.clone())).spawn()?;

    let engine = server::with_relays(server::Server::new(command_rx, event_tx, config.autostart_dir.as_deref()));
    let result = engine.serve(listener);

    let _ = std::fs::remove_file(&socket);
    result
}
