// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Signal handling for the control loop.
//!
//! Handlers only raise flags and poke a socket pair. The loop looks at the
//! flags at its checkpoints and sleeps on the socket so that a termination
//! request cuts the sleep short.

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;

const TERM_SIGNALS: [libc::c_int; 3] = [SIGTERM, SIGINT, SIGQUIT];

/// Cloneable way to raise the same requests a signal would.
#[derive(Clone, Debug)]
pub struct SignalHandle {
    terminate: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    waker: Arc<UnixStream>,
}

impl SignalHandle {
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
        // A full socket already holds a wakeup.
        let _ = (&*self.waker).write(&[1]);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct Signals {
    terminate: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    wakeup: UnixStream,
    waker: Arc<UnixStream>,
}

impl Signals {
    /// Flags and wakeup channel without any handler installed.
    pub fn new() -> Result<Signals> {
        let (wakeup, waker) = UnixStream::pair().context("Failed to create wakeup socket pair")?;
        waker
            .set_nonblocking(true)
            .context("Failed to make wakeup socket non-blocking")?;

        Ok(Signals {
            terminate: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            wakeup,
            waker: Arc::new(waker),
        })
    }

    /// Route SIGTERM, SIGINT and SIGQUIT to termination and SIGHUP to reload.
    pub fn install() -> Result<Signals> {
        let signals = Self::new()?;

        for sig in TERM_SIGNALS {
            signal_hook::flag::register(sig, signals.terminate.clone())
                .with_context(|| format!("Failed to register handler for signal {}", sig))?;
            let waker = signals
                .waker
                .try_clone()
                .context("Failed to clone wakeup socket")?;
            signal_hook::low_level::pipe::register(sig, waker)
                .with_context(|| format!("Failed to register wakeup for signal {}", sig))?;
        }
        signal_hook::flag::register(SIGHUP, signals.reload.clone())
            .context("Failed to register handler for SIGHUP")?;

        Ok(signals)
    }

    pub fn handle(&self) -> SignalHandle {
        SignalHandle {
            terminate: self.terminate.clone(),
            reload: self.reload.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }

    /// Sleep for @dur or until termination is requested. Returns false if the
    /// sleep was cut short.
    pub fn sleep(&self, dur: Duration) -> bool {
        // Without a representable deadline, wait for termination only.
        let deadline = Instant::now().checked_add(dur);
        let mut buf = [0u8; 16];

        loop {
            if self.terminate_requested() {
                return false;
            }
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            if self.wakeup.set_read_timeout(timeout).is_err() {
                if let Some(timeout) = timeout {
                    std::thread::sleep(timeout);
                }
                continue;
            }
            match (&self.wakeup).read(&mut buf) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => {
                    if let Some(deadline) = deadline {
                        std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    }
                }
            }
        }
    }
}
