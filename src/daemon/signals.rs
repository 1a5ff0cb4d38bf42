//! Signal handling: SIGTERM/SIGINT shut down, SIGHUP reloads the config,
//! SIGUSR1 kicks the lurker.
//!
//! Handlers only set flags (`signal-hook`); the supervising loop polls them.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Signal flags shared between the OS handlers and the supervisor loop.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
    kick_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register the OS hooks.
    ///
    /// Registration failures are reported on stderr and otherwise ignored.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Flags only, no OS hooks. Used by tests and embedders with their own handling.
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
            kick_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear the reload request.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    /// Check and clear the kick request.
    pub fn should_kick(&self) -> bool {
        self.kick_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_kick(&self) {
        self.kick_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[LRK-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[LRK-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                eprintln!("[LRK-SIGNAL] failed to register SIGHUP: {e}");
            }
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.kick_flag)) {
                eprintln!("[LRK-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        let h = SignalHandler::unregistered();
        assert!(!h.should_shutdown());
        assert!(!h.should_reload());
        assert!(!h.should_kick());
    }

    #[test]
    fn shutdown_is_sticky() {
        let h = SignalHandler::unregistered();
        h.request_shutdown();
        assert!(h.should_shutdown());
        assert!(h.should_shutdown());
    }

    #[test]
    fn reload_and_kick_clear_on_read() {
        let h = SignalHandler::unregistered();
        h.request_reload();
        h.request_kick();
        assert!(h.should_reload());
        assert!(!h.should_reload());
        assert!(h.should_kick());
        assert!(!h.should_kick());
    }

    #[test]
    fn clones_share_flags() {
        let h = SignalHandler::unregistered();
        let h2 = h.clone();
        std::thread::spawn(move || h2.request_kick()).join().unwrap();
        assert!(h.should_kick());
    }

    #[cfg(unix)]
    #[test]
    fn sigusr1_sets_kick_flag() {
        let h = SignalHandler::new();
        signal_hook::low_level::raise(signal_hook::consts::SIGUSR1).unwrap();
        assert!(h.should_kick());
    }
}
