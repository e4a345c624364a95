//! The engine-internal signal bus (spec §6 Design Notes: "accumulator
//! pattern for register-request, plain fan-out for the rest").
//!
//! This is not the D-Bus bus; it is the in-process callback registry
//! the client state machine and the daemon's event loop use to reach
//! the control-surface adaptor without a direct dependency on it.

/// Carried by `EndSessionResponse` signals (spec §4.2.4, §6).
#[derive(Debug, Clone)]
pub struct EndSessionResponse {
    pub is_ok: bool,
    pub do_last: bool,
    pub cancel: bool,
    pub reason: Option<String>,
}

type RegisterRequestHandler = Box<dyn FnMut(&str) -> Option<String>>;
type LogoutRequestHandler = Box<dyn FnMut(bool)>;
type DisconnectedHandler = Box<dyn FnMut(&str)>;
type EndSessionResponseHandler = Box<dyn FnMut(&str, &EndSessionResponse)>;
type ClientRegisteredHandler = Box<dyn FnMut(&str)>;

/// A single-consumer-per-signal dispatcher. `register-request` is an
/// accumulator: handlers run in registration order and the first one
/// to return a non-empty id wins and stops the chain (spec §4.2.3).
/// Every other signal is plain fan-out to every registered handler.
#[derive(Default)]
pub struct SignalBus {
    register_request: Vec<RegisterRequestHandler>,
    logout_request: Vec<LogoutRequestHandler>,
    disconnected: Vec<DisconnectedHandler>,
    end_session_response: Vec<EndSessionResponseHandler>,
    client_registered: Vec<ClientRegisteredHandler>,
}

impl SignalBus {
    pub fn new() -> Self {
        SignalBus::default()
    }

    pub fn on_register_request(&mut self, handler: impl FnMut(&str) -> Option<String> + 'static) {
        self.register_request.push(Box::new(handler));
    }

    pub fn on_logout_request(&mut self, handler: impl FnMut(bool) + 'static) {
        self.logout_request.push(Box::new(handler));
    }

    pub fn on_disconnected(&mut self, handler: impl FnMut(&str) + 'static) {
        self.disconnected.push(Box::new(handler));
    }

    pub fn on_end_session_response(&mut self, handler: impl FnMut(&str, &EndSessionResponse) + 'static) {
        self.end_session_response.push(Box::new(handler));
    }

    /// Fired the moment a client transitions to `Registered`, so the
    /// D-Bus adaptor knows to publish an object for it.
    pub fn on_client_registered(&mut self, handler: impl FnMut(&str) + 'static) {
        self.client_registered.push(Box::new(handler));
    }

    /// Runs the accumulator: each handler in turn, stopping at the
    /// first one that marks the signal handled, even with an explicit
    /// empty-string reject (spec §4.2.3; mirrors the GLib
    /// `_boolean_handled_accumulator` semantics `gsm-xsmp-client.c`'s
    /// register-request chain is built on).
    pub fn fire_register_request(&mut self, prev_id: &str) -> Option<String> {
        for handler in self.register_request.iter_mut() {
            if let Some(id) = handler(prev_id) {
                return Some(id);
            }
        }
        None
    }

    pub fn fire_logout_request(&mut self, show_dialog: bool) {
        for handler in self.logout_request.iter_mut() {
            handler(show_dialog);
        }
    }

    pub fn fire_disconnected(&mut self, path: &str) {
        for handler in self.disconnected.iter_mut() {
            handler(path);
        }
    }

    pub fn fire_end_session_response(&mut self, path: &str, response: EndSessionResponse) {
        for handler in self.end_session_response.iter_mut() {
            handler(path, &response);
        }
    }

    pub fn fire_client_registered(&mut self, path: &str) {
        for handler in self.client_registered.iter_mut() {
            handler(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn register_request_stops_at_first_non_empty_id() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut bus = SignalBus::new();

        let c1 = calls.clone();
        bus.on_register_request(move |_| {
            c1.borrow_mut().push(1);
            None
        });
        let c2 = calls.clone();
        bus.on_register_request(move |_| {
            c2.borrow_mut().push(2);
            Some("won".to_string())
        });
        let c3 = calls.clone();
        bus.on_register_request(move |_| {
            c3.borrow_mut().push(3);
            Some("should-not-run".to_string())
        });

        let id = bus.fire_register_request("");
        assert_eq!(id, Some("won".to_string()));
        assert_eq!(*calls.borrow(), vec![1, 2]);
    }

    #[test]
    fn register_request_stops_on_an_explicit_empty_reject() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut bus = SignalBus::new();

        let c1 = calls.clone();
        bus.on_register_request(move |_| {
            c1.borrow_mut().push(1);
            Some(String::new())
        });
        let c2 = calls.clone();
        bus.on_register_request(move |_| {
            c2.borrow_mut().push(2);
            Some("should-not-run".to_string())
        });

        let id = bus.fire_register_request("");
        assert_eq!(id, Some(String::new()));
        assert_eq!(*calls.borrow(), vec![1]);
    }

    #[test]
    fn fan_out_signals_reach_every_handler() {
        let seen = Rc::new(RefCell::new(0));
        let mut bus = SignalBus::new();
        for _ in 0..3 {
            let s = seen.clone();
            bus.on_disconnected(move |_| *s.borrow_mut() += 1);
        }
        bus.fire_disconnected("/path");
        assert_eq!(*seen.borrow(), 3);
    }
}
