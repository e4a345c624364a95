//! The per-client XSMP property set (spec §3).
//!
//! A property is a name drawn from a fixed vocabulary, a type tag, and
//! one or more opaque byte-string values. Properties are replaceable by
//! name: setting a property of a name that already exists discards the
//! old one.

use std::collections::HashMap;

/// Standard XSMP property names this engine understands directly. Peers
/// may set other property names too; those are stored but never
/// interpreted.
pub mod names {
    pub const PROGRAM: &str = "SmProgram";
    pub const RESTART_COMMAND: &str = "SmRestartCommand";
    pub const DISCARD_COMMAND: &str = "SmDiscardCommand";
    pub const RESTART_STYLE_HINT: &str = "SmRestartStyleHint";
    pub const PROCESS_ID: &str = "SmProcessID";
    pub const USER_ID: &str = "SmUserID";
    pub const CLONE_COMMAND: &str = "SmCloneCommand";
    pub const CURRENT_DIRECTORY: &str = "SmCurrentDirectory";
    /// non-standard, mate-session-manager specific: file:// URI of the
    /// on-disk desktop-entry this client was launched from.
    pub const GSM_DESKTOP_FILE: &str = "_GSM_DesktopFile";
}

/// The wire type tag carried alongside a property's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Byte,
    ByteString,
    ListOfByteString,
}

/// A single XSMP property: a name, its type, and one or more values.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub ty: PropertyType,
    pub values: Vec<Vec<u8>>,
}

impl Property {
    pub fn byte_string(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Property { name: name.into(), ty: PropertyType::ByteString, values: vec![value.into()] }
    }

    pub fn list_of_byte_string(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Property { name: name.into(), ty: PropertyType::ListOfByteString, values }
    }

    pub fn byte(name: impl Into<String>, value: u8) -> Self {
        Property { name: name.into(), ty: PropertyType::Byte, values: vec![vec![value]] }
    }

    /// The first value as a lossily-decoded string, if any value is present.
    pub fn first_as_str(&self) -> Option<String> {
        self.values.first().map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

/// Holds a client's declared properties. Owned exclusively by the
/// `Client` it belongs to (spec §3).
#[derive(Debug, Default)]
pub struct PropertySet {
    props: HashMap<String, Property>,
}

impl PropertySet {
    pub fn new() -> Self {
        PropertySet { props: HashMap::new() }
    }

    /// Deletes any existing property of the same name, then inserts the
    /// new one. Matches `SetProperties` semantics (spec §4.2.3).
    pub fn set(&mut self, prop: Property) {
        self.props.insert(prop.name.clone(), prop);
    }

    pub fn delete(&mut self, name: &str) {
        self.props.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.props.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.props.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_same_name() {
        let mut set = PropertySet::new();
        set.set(Property::byte_string(names::PROGRAM, b"foo".to_vec()));
        set.set(Property::byte_string(names::PROGRAM, b"bar".to_vec()));
        assert_eq!(set.get(names::PROGRAM).unwrap().first_as_str().unwrap(), "bar");
        assert_eq!(set.iter().count(), 1);
    }

    #[test]
    fn delete_removes_by_name() {
        let mut set = PropertySet::new();
        set.set(Property::byte_string(names::PROGRAM, b"foo".to_vec()));
        set.delete(names::PROGRAM);
        assert!(set.get(names::PROGRAM).is_none());
    }
}
