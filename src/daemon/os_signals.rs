//! Graceful shutdown on SIGTERM/SIGINT (spec §A ambient stack).
//! Grounded on the teacher's `daemon/signals.rs`: the
//! conditional-shutdown-then-arm `signal_hook::flag` idiom, run on a
//! dedicated thread since signal delivery can't be polled alongside
//! the client fds in `daemon/server.rs`'s event loop.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use signal_hook::iterator::Signals;
use tracing::{error, info};

pub struct Handler {
    sock: Option<PathBuf>,
}

impl Handler {
    pub fn new(sock: Option<PathBuf>) -> Self {
        Handler { sock }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        // shut down immediately on a second term signal rather than
        // getting stuck attempting a graceful shutdown twice
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;

        thread::spawn(move || {
            for signal in &mut signals {
                info!(signal, "shutting down on signal");
                if let Some(sock) = &self.sock {
                    if let Err(e) = std::fs::remove_file(sock).context("cleaning up socket") {
                        error!("error cleaning up socket file: {}", e);
                    }
                }
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
