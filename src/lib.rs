//! `xsmpd`'s modules, exposed as a library so the integration tests
//! under `tests/` can drive the client state machine directly instead
//! of spawning the compiled daemon as a subprocess.

pub mod client;
pub mod codec;
pub mod consts;
pub mod daemon;
pub mod dbus_surface;
pub mod property;
pub mod protocol;
pub mod quote;
pub mod registry;
pub mod sigbus;
#[allow(dead_code)]
pub mod test_hooks;
