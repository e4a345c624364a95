//! Daemon configuration, loaded from an optional TOML file (spec §A).

use std::fs;

use anyhow::Context;
use serde_derive::Deserialize;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// well-known name requested on the session bus. Defaults to
    /// `org.gnome.SessionManager` (spec §4.4).
    pub bus_name: Option<String>,
    /// log level passed through to the tracing subscriber, e.g.
    /// "info" or "xsmpd=debug,zbus=warn". Defaults to "info", unless
    /// overridden by `-v`/`-vv` on the command line.
    pub log_level: Option<String>,
    /// directory searched (highest priority) for autostart desktop
    /// entries, overriding `$XDG_CONFIG_HOME/autostart`.
    pub autostart_dir: Option<String>,
}

impl Config {
    /// Reads and parses `path` if given, else returns the default
    /// configuration.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let contents = fs::read_to_string(path).context("reading config toml")?;
                toml::from_str(&contents).context("parsing config file")
            }
            None => Ok(Config::default()),
        }
    }
}
