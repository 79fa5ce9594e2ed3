//! SIGTERM/SIGINT shutdown flag for the daemon loop.
//!
//! Uses `signal-hook` flag registration; the loop polls the flag between
//! ticks and sleep slices rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Shared shutdown state. Clones observe the same flag.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create the flag and register SIGTERM/SIGINT against it.
    ///
    /// Registration failures are reported on stderr; the daemon still runs
    /// and can be stopped by killing the process.
    pub fn install() -> Self {
        let signal = Self::unregistered();
        for (name, sig) in [("SIGTERM", SIGTERM), ("SIGINT", SIGINT)] {
            if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&signal.flag)) {
                eprintln!("[GPI-SIGNAL] failed to register {name}: {e}");
            }
        }
        signal
    }

    /// A flag with no OS hooks, for tests and embedding.
    pub fn unregistered() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}
