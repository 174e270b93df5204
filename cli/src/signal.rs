//! SIGINT/SIGTERM latch polled by the foreground `run` loop.

use std::sync::atomic::{AtomicBool, Ordering};

static RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    RECEIVED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the latch.
pub fn install() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

pub fn received() -> bool {
    RECEIVED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigterm_sets_latch() {
        install();
        assert!(!received());
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert!(received());
    }
}
