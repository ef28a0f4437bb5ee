// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Signal wiring for the daemon's main loop. SIGTERM/SIGINT just flip a
// shared flag that every thread polls at its loop edges. SIGHUP (reload)
// and SIGUSR1 (dump stats) need an actual application-level reaction, so
// they get their own polling thread instead of a bare flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::flag;
use signal_hook::iterator::Signals;

use crate::error::LcapError;

/// Register SIGTERM/SIGINT directly against `terminate`, and spawn a
/// background thread that turns SIGHUP into a reload request and SIGUSR1
/// into a stats-dump request. `dump_generation` is a counter rather than a
/// single flag because every reader thread needs to notice the same
/// SIGUSR1 independently — a swap-and-clear flag would only ever be
/// observed by whichever reader happened to poll it first.
pub struct SignalState {
    pub terminate: Arc<AtomicBool>,
    pub reload: Arc<AtomicBool>,
    pub dump_generation: Arc<AtomicU64>,
    _watcher: JoinHandle<()>,
}

impl SignalState {
    pub fn install() -> Result<SignalState, LcapError> {
        let terminate = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let dump_generation = Arc::new(AtomicU64::new(0));

        flag::register(SIGTERM, terminate.clone())
            .map_err(|e| LcapError::Fatal(format!("cannot register SIGTERM handler: {e}")))?;
        flag::register(SIGINT, terminate.clone())
            .map_err(|e| LcapError::Fatal(format!("cannot register SIGINT handler: {e}")))?;

        let mut signals = Signals::new([SIGHUP, SIGUSR1])
            .map_err(|e| LcapError::Fatal(format!("cannot register SIGHUP/SIGUSR1 handler: {e}")))?;

        let reload_flag = reload.clone();
        let dump_gen = dump_generation.clone();
        let watcher = std::thread::spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGHUP => {
                        log::info!("received SIGHUP: reload requested");
                        reload_flag.store(true, Ordering::Relaxed);
                    }
                    SIGUSR1 => {
                        log::info!("received SIGUSR1: stats dump requested");
                        dump_gen.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => unreachable!("only SIGHUP/SIGUSR1 were registered"),
                }
            }
        });

        Ok(SignalState { terminate, reload, dump_generation, _watcher: watcher })
    }

    /// Consume a pending reload request, if any.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }
}
