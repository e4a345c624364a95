use std::time;

/// how long a handshake read may block before the engine gives up on a peer
pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);

/// max size of a single XSMP frame payload we're willing to buffer
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// prefix for every client's bus object path, followed by its serial
pub const CLIENT_OBJECT_PATH_PREFIX: &str = "/org/gnome/SessionManager/Client";

/// well-known bus name the engine requests on the session bus
pub const BUS_NAME: &str = "org.gnome.SessionManager";

/// default path of the engine's control socket, relative to $XDG_RUNTIME_DIR
pub const DEFAULT_SOCKET_NAME: &str = "xsmpd.socket";

/// fallback autostart directory, relative to $HOME, when XDG_CONFIG_HOME is unset
pub const FALLBACK_AUTOSTART_DIR: &str = ".config/autostart";
