//! SIGINT/SIGTERM handling - turns termination signals into cancellation

use anyhow::{Context, Result};
use kibanakit::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
const SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

/// Cancel `cancel` when the process receives SIGINT or SIGTERM.
///
/// The handler only flips a flag; a watcher thread forwards it to the token
/// so that sleeping workers are woken. Once the token is cancelled the
/// default handlers are back, so a second signal terminates the process.
#[cfg(unix)]
pub fn install(cancel: &CancelToken) -> Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int);
    for signal in SIGNALS {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            anyhow::bail!("Failed to install handler for signal {signal}");
        }
    }
    spawn_watcher(cancel.clone())
}

#[cfg(not(unix))]
pub fn install(cancel: &CancelToken) -> Result<()> {
    log::debug!("signal handling is not supported on this platform");
    spawn_watcher(cancel.clone())
}

#[cfg(unix)]
fn restore_defaults() {
    for signal in SIGNALS {
        // SAFETY: SIG_DFL is always a valid disposition.
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
}

#[cfg(not(unix))]
const fn restore_defaults() {}

fn spawn_watcher(cancel: CancelToken) -> Result<()> {
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            loop {
                if SIGNALLED.load(Ordering::SeqCst) {
                    log::warn!(
                        "termination requested, letting in-flight actions finish (signal again to abort)"
                    );
                    restore_defaults();
                    cancel.cancel();
                    return;
                }
                // returns early once the token is cancelled elsewhere
                if cancel.wait_timeout(Duration::from_millis(100)) {
                    restore_defaults();
                    return;
                }
            }
        })
        .context("Failed to start signal watcher")?;
    Ok(())
}
