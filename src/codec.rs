//! Save/restore of a client's state to an autostart desktop-entry file
//! (spec §4.3, supplemented from `gsm-xsmp-client.c`'s `xsmp_save`).
//!
//! No `.ini`/keyfile crate appears anywhere in the corpus this engine
//! is grounded on, so the `[Desktop Entry]` group is read and written
//! by hand. The format is deliberately narrow: one group, `Key=Value`
//! lines, `#`-prefixed comments and blank lines preserved verbatim so
//! a round-trip of an entry this engine didn't write doesn't lose
//! unrelated keys.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::client::RestartStyleHint;
use crate::property::{names, PropertySet};
use crate::quote;

const GROUP_HEADER: &str = "[Desktop Entry]";
const KEY_NAME: &str = "Name";
const KEY_COMMENT: &str = "Comment";
const KEY_ICON: &str = "Icon";
const KEY_TYPE: &str = "Type";
const KEY_STARTUP_NOTIFY: &str = "StartupNotify";
const KEY_EXEC: &str = "Exec";
const KEY_STARTUP_ID: &str = "X-GNOME-Autostart-startup-id";
const KEY_DISCARD: &str = "X-GNOME-Autostart-discard-command";

/// Fallback shown in place of `SmProgram` when a client never declared
/// a program name (spec §4.3's supplemented localized-fallback note;
/// no i18n crate is in scope so this is the fixed English string).
const FALLBACK_NAME: &str = "Remembered Application";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no restart command set, nothing to save")]
    NoRestartCommand,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// `RestartStyleHint` was `Never`, or there was no restart command:
    /// nothing written (spec §4.3).
    Skipped,
    Written(PathBuf),
}

/// Ordered search path for autostart desktop-entry directories,
/// highest priority first. Writes always target the first entry.
pub struct AutostartDirs(Vec<PathBuf>);

impl AutostartDirs {
    /// Builds the search order from the environment: `$XDG_CONFIG_HOME`
    /// (or `~/.config` if unset) first, then each `$XDG_CONFIG_DIRS`
    /// entry (or `/etc/xdg` if unset), each with an `autostart`
    /// subdirectory appended.
    pub fn from_env() -> Self {
        let mut dirs = Vec::new();
        match env::var_os("XDG_CONFIG_HOME") {
            Some(config_home) => dirs.push(PathBuf::from(config_home).join("autostart")),
            None => {
                if let Some(home) = env::var_os("HOME") {
                    dirs.push(PathBuf::from(home).join(crate::consts::FALLBACK_AUTOSTART_DIR));
                }
            }
        }
        let config_dirs = env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_string());
        for dir in config_dirs.split(':').filter(|s| !s.is_empty()) {
            dirs.push(Path::new(dir).join("autostart"));
        }
        AutostartDirs(dirs)
    }

    /// Like `from_env`, but with the daemon config's `autostart_dir`
    /// setting, if any, searched (and written to) ahead of everything
    /// else (spec §A).
    pub fn from_config(autostart_dir_override: Option<&str>) -> Self {
        let mut dirs = Self::from_env();
        if let Some(dir) = autostart_dir_override {
            dirs.0.insert(0, PathBuf::from(dir));
        }
        dirs
    }

    pub fn search_order(&self) -> &[PathBuf] {
        &self.0
    }

    fn write_target(&self) -> &Path {
        &self.0[0]
    }

    /// Finds an existing `<app_name>.desktop` in the search order, most
    /// specific directory first.
    pub fn find_for_app_name(&self, app_name: &str) -> Option<PathBuf> {
        let file_name = format!("{}.desktop", app_name);
        self.0.iter().map(|d| d.join(&file_name)).find(|p| p.exists())
    }
}

/// A loosely parsed `[Desktop Entry]` group: known keys plus anything
/// else, preserved so an entry this engine restores but doesn't
/// recognize isn't silently dropped on the next save.
#[derive(Debug, Default, Clone)]
struct DesktopEntry {
    keys: BTreeMap<String, String>,
}

impl DesktopEntry {
    fn get(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(|s| s.as_str())
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.keys.insert(key.to_string(), value.into());
    }

    fn parse(contents: &str) -> Self {
        let mut entry = DesktopEntry::default();
        let mut in_group = false;
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') {
                in_group = trimmed == GROUP_HEADER;
                continue;
            }
            if !in_group {
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                entry.set(key.trim(), value.trim());
            }
        }
        entry
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(GROUP_HEADER);
        out.push('\n');
        for (key, value) in &self.keys {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

fn read_entry(path: &Path) -> io::Result<DesktopEntry> {
    let contents = fs::read_to_string(path)?;
    Ok(DesktopEntry::parse(&contents))
}

fn write_entry(path: &Path, entry: &DesktopEntry) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, entry.render())?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// A parsed autostart entry, exposed as the read-only view capplet-style
/// tools use to list what this engine would restore (spec §4.3).
#[derive(Debug, Clone)]
pub struct AutostartEntry {
    pub path: PathBuf,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub exec: Option<String>,
    pub discard_command: Option<String>,
}

/// Parses every `.desktop` file across `dirs.search_order()`. An entry
/// that fails to parse is skipped with a warning rather than aborting
/// the whole listing.
pub fn read_entries(dirs: &AutostartDirs) -> Vec<AutostartEntry> {
    let mut entries = Vec::new();
    for dir in dirs.search_order() {
        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
                continue;
            }
            let parsed = match read_entry(&path) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to parse autostart entry: {}", e);
                    continue;
                }
            };
            entries.push(AutostartEntry {
                name: parsed.get(KEY_NAME).map(str::to_string),
                comment: parsed.get(KEY_COMMENT).map(str::to_string),
                exec: parsed.get(KEY_EXEC).map(str::to_string),
                discard_command: parsed.get(KEY_DISCARD).map(str::to_string),
                path,
            });
        }
    }
    entries
}

fn restart_style_hint(properties: &PropertySet) -> RestartStyleHint {
    match properties.get(names::RESTART_STYLE_HINT) {
        Some(p) => match p.values.first().and_then(|v| v.first()).copied() {
            Some(0) => RestartStyleHint::IfRunning,
            Some(1) => RestartStyleHint::Anyway,
            Some(2) => RestartStyleHint::Immediately,
            Some(3) => RestartStyleHint::Never,
            _ => RestartStyleHint::IfRunning,
        },
        None => RestartStyleHint::IfRunning,
    }
}

/// Saves one client's state to an autostart desktop-entry file (spec
/// §4.3). A client with `RestartStyleHint::Never`, or with no restart
/// command, is skipped rather than an error: it simply isn't meant to
/// come back.
pub fn save(properties: &PropertySet, startup_id: &str, dirs: &AutostartDirs) -> Result<SaveOutcome, CodecError> {
    if restart_style_hint(properties) == RestartStyleHint::Never {
        return Ok(SaveOutcome::Skipped);
    }
    let restart_command = match properties.get(names::RESTART_COMMAND) {
        Some(p) if !p.values.is_empty() => quote::command_string(&p.values),
        _ => return Ok(SaveOutcome::Skipped),
    };

    let desktop_file_path = desktop_file_path_for(properties, dirs);
    let mut entry = match &desktop_file_path {
        Some(path) => read_entry(path).unwrap_or_default(),
        None => synth_entry(properties),
    };

    entry.set(KEY_STARTUP_ID, startup_id);
    entry.set(KEY_EXEC, restart_command);
    if let Some(p) = properties.get(names::DISCARD_COMMAND) {
        if !p.values.is_empty() {
            entry.set(KEY_DISCARD, quote::command_string(&p.values));
        }
    }

    let target = match &desktop_file_path {
        Some(path) => path.clone(),
        None => {
            let program = properties.get(names::PROGRAM).and_then(|p| p.first_as_str());
            let app_name = program.as_deref().unwrap_or("unknown-application");
            dirs.write_target().join(format!("{}.desktop", sanitize_file_stem(app_name)))
        }
    };
    write_entry(&target, &entry)?;
    Ok(SaveOutcome::Written(target))
}

fn sanitize_file_stem(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' }).collect()
}

/// Locates an existing entry to merge into, never a write target: a
/// peer-supplied `_GSM_DesktopFile` is only honored when it resolves
/// inside one of `dirs.search_order()`, so a client can't direct a
/// write anywhere on disk (spec §9, "must not escape the autostart
/// directories when writing back"). Anything else falls back to an
/// app-name lookup, and an out-of-bounds URI is rejected with a
/// warning rather than silently ignored.
fn desktop_file_path_for(properties: &PropertySet, dirs: &AutostartDirs) -> Option<PathBuf> {
    if let Some(p) = properties.get(names::GSM_DESKTOP_FILE) {
        if let Some(uri) = p.first_as_str() {
            if let Some(path) = uri.strip_prefix("file://") {
                let candidate = normalize(Path::new(path));
                if is_confined(&candidate, dirs) {
                    return Some(candidate);
                }
                tracing::warn!(
                    path = %candidate.display(),
                    "_GSM_DesktopFile points outside the autostart directories, ignoring"
                );
            }
        }
    }
    let program = properties.get(names::PROGRAM).and_then(|p| p.first_as_str())?;
    dirs.find_for_app_name(&program)
}

/// Lexically resolves `.`/`..` components without touching the
/// filesystem, so confinement can't be defeated by a path that merely
/// spells its way out of `dirs` (e.g. `<autostart>/../../etc/foo`).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn is_confined(path: &Path, dirs: &AutostartDirs) -> bool {
    dirs.search_order().iter().any(|d| path.starts_with(normalize(d)))
}

fn synth_entry(properties: &PropertySet) -> DesktopEntry {
    let mut entry = DesktopEntry::default();
    let name = properties
        .get(names::PROGRAM)
        .and_then(|p| p.first_as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    entry.set(KEY_NAME, name);
    entry.set(KEY_COMMENT, "automatically saved session client".to_string());
    entry.set(KEY_ICON, "system-run");
    entry.set(KEY_TYPE, "Application");
    entry.set(KEY_STARTUP_NOTIFY, "true");
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Property;
    use tempfile::tempdir;

    fn dirs_in(root: &Path) -> AutostartDirs {
        AutostartDirs(vec![root.join("autostart")])
    }

    #[test]
    fn never_hint_is_skipped() {
        let dir = tempdir().unwrap();
        let mut props = PropertySet::new();
        props.set(Property::byte(names::RESTART_STYLE_HINT, 3));
        props.set(Property::list_of_byte_string(names::RESTART_COMMAND, vec![b"foo".to_vec()]));
        let outcome = save(&props, "startup-1", &dirs_in(dir.path())).unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped);
    }

    #[test]
    fn missing_restart_command_is_skipped() {
        let dir = tempdir().unwrap();
        let props = PropertySet::new();
        let outcome = save(&props, "startup-1", &dirs_in(dir.path())).unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped);
    }

    #[test]
    fn writes_synthesized_entry_with_quoted_exec() {
        let dir = tempdir().unwrap();
        let mut props = PropertySet::new();
        props.set(Property::list_of_byte_string(
            names::RESTART_COMMAND,
            vec![b"my app".to_vec(), b"--file=/tmp/a'b".to_vec()],
        ));
        props.set(Property::list_of_byte_string(names::PROGRAM, vec![b"my app".to_vec()]));

        let outcome = save(&props, "startup-1", &dirs_in(dir.path())).unwrap();
        let path = match outcome {
            SaveOutcome::Written(p) => p,
            other => panic!("expected Written, got {:?}", other),
        };
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains(r#"Exec='my app' '--file=/tmp/a'\''b'"#));
        assert!(contents.contains("X-GNOME-Autostart-startup-id=startup-1"));

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn existing_entry_keys_survive_a_resave() {
        let dir = tempdir().unwrap();
        let autostart = dir.path().join("autostart");
        fs::create_dir_all(&autostart).unwrap();
        let path = autostart.join("xterm.desktop");
        fs::write(&path, "[Desktop Entry]\nName=XTerm\nCustomKey=keepme\n").unwrap();

        let mut props = PropertySet::new();
        props.set(Property::list_of_byte_string(names::PROGRAM, vec![b"xterm".to_vec()]));
        props.set(Property::list_of_byte_string(names::RESTART_COMMAND, vec![b"xterm".to_vec()]));

        save(&props, "startup-2", &dirs_in(dir.path())).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Name=XTerm"));
        assert!(contents.contains("CustomKey=keepme"));
        assert!(contents.contains("Exec=xterm"));
    }
}
