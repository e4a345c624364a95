//! Client registry and path allocation (spec §4.1).

use std::collections::HashMap;

use crate::client::Client;

/// Formats an object path from the fixed prefix and an allocated serial.
pub fn format_path(serial: i32) -> String {
    format!("{}{}", crate::consts::CLIENT_OBJECT_PATH_PREFIX, serial)
}

/// Owns the mapping from stable client path to `Client`, and the serial
/// counter used to allocate fresh paths.
///
/// The counter starts at 1 and wraps back to 1 the moment the
/// incremented value would read as negative when interpreted as a
/// signed 32 bit integer (spec §4.1), matching the source's
/// `get_next_client_serial`.
pub struct Registry {
    clients: HashMap<String, Client>,
    next_serial: i32,
}

impl Registry {
    pub fn new() -> Self {
        Registry { clients: HashMap::new(), next_serial: 1 }
    }

    fn allocate_serial(&mut self) -> i32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        if self.next_serial < 0 {
            self.next_serial = 1;
        }
        serial
    }

    /// Allocates a fresh path, inserts `make_client(path)`'s result, and
    /// returns the path.
    pub fn insert(&mut self, make_client: impl FnOnce(String) -> Client) -> String {
        let serial = self.allocate_serial();
        let path = format_path(serial);
        let client = make_client(path.clone());
        self.clients.insert(path.clone(), client);
        path
    }

    pub fn lookup(&self, path: &str) -> Option<&Client> {
        self.clients.get(path)
    }

    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Client> {
        self.clients.get_mut(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<Client> {
        self.clients.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Client)> {
        self.clients.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Client)> {
        self.clients.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Test-only hook: force the serial counter to a specific value so
    /// wraparound can be exercised without allocating ~2^31 clients.
    #[cfg(test)]
    pub fn set_next_serial_for_test(&mut self, serial: i32) {
        self.next_serial = serial;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::dummy_xsmp_client;

    #[test]
    fn paths_are_assigned_in_increasing_order() {
        let mut reg = Registry::new();
        let p1 = reg.insert(|path| dummy_xsmp_client(path));
        let p2 = reg.insert(|path| dummy_xsmp_client(path));
        assert_eq!(p1, format_path(1));
        assert_eq!(p2, format_path(2));
    }

    #[test]
    fn serial_wraps_to_one_past_signed_boundary() {
        let mut reg = Registry::new();
        reg.set_next_serial_for_test(i32::MAX);
        let p1 = reg.insert(|path| dummy_xsmp_client(path));
        assert_eq!(p1, format_path(i32::MAX));
        let p2 = reg.insert(|path| dummy_xsmp_client(path));
        assert_eq!(p2, format_path(1));
    }

    #[test]
    fn two_live_clients_never_share_a_path() {
        let mut reg = Registry::new();
        let p1 = reg.insert(|path| dummy_xsmp_client(path));
        let p2 = reg.insert(|path| dummy_xsmp_client(path));
        assert_ne!(p1, p2);
    }

    #[test]
    fn remove_drops_entry() {
        let mut reg = Registry::new();
        let p1 = reg.insert(|path| dummy_xsmp_client(path));
        assert!(reg.lookup(&p1).is_some());
        reg.remove(&p1);
        assert!(reg.lookup(&p1).is_none());
    }
}
