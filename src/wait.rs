//! Low-level atomic wait/wake, used by the MVCC history to block a reader on
//! a shadow block that is still in its `init` state.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub fn futex_wait(atom: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;

    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as i64,
    });
    let ts_ptr = ts
        .as_ref()
        .map(|t| t as *const libc::timespec)
        .unwrap_or(std::ptr::null());

    if atom.load(Ordering::Acquire) != expected {
        return;
    }
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            atom as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
        )
    };
    // EAGAIN (value changed before we slept), EINTR and ETIMEDOUT are all
    // fine: the caller re-checks the value in a loop.
    let _ = rc;
}

#[cfg(target_os = "linux")]
pub fn futex_wake(atom: &AtomicU32, n: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atom as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            n,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(atom: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;
    let step = Duration::from_micros(50);
    let deadline = timeout.map(|d| std::time::Instant::now() + d);
    while atom.load(Ordering::Acquire) == expected {
        if let Some(dl) = deadline {
            if std::time::Instant::now() >= dl {
                break;
            }
        }
        std::thread::sleep(step);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_atom: &AtomicU32, _n: i32) {
    // Nothing to do: the fallback waiter polls on its own.
}

/// Wait for a state word to reach `expected` or above, returning the
/// observed value (it may be a different terminal value, e.g. `garbage`
/// instead of `wr`, matching the original history's "wait for any state >=
/// expected" semantics). Spins briefly first — the expected hold time here is
/// one peer transaction finishing a `memcpy` into its own shadow, per
/// SPEC_FULL §5's "briefly" suspension point — then parks on the futex so a
/// genuinely slow peer doesn't burn a core.
pub fn wait_at_least(atom: &AtomicU32, expected: u32) -> u32 {
    use std::sync::atomic::Ordering;
    for spins in 0..1000u32 {
        let v = atom.load(Ordering::Acquire);
        if v >= expected {
            return v;
        }
        if spins < 200 {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
    loop {
        let v = atom.load(Ordering::Acquire);
        if v >= expected {
            return v;
        }
        futex_wait(atom, v, Some(Duration::from_millis(10)));
    }
}
