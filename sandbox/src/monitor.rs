//! Monitor threads of the supervisor.
//!
//! Each monitor is a detached thread enforcing one ceiling the kernel cannot
//! enforce precisely on its own: the wall-clock budget, the resident-set
//! size, and the thread count. A monitor owns its [`KillerHandle`], probes
//! the child periodically, kills on breach and terminates once the child is
//! gone. Monitors never reap: the supervisor's wait call absorbs whatever
//! signal a monitor delivered.
//!

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::misc;

/// Interval between consecutive `/proc` probes of the polling monitors.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Extra sleep granted on top of the wall-clock budget, so the killer wakes
/// strictly after the budget has run out rather than racing it.
const WALL_CLOCK_GRACE_MS: i64 = 100;

/// Everything a monitor thread owns: the pid it watches and the ceiling it
/// enforces. Moved into the detached thread at spawn time; the supervisor
/// keeps no reference to it.
struct KillerHandle {
    pid: Pid,
    limit: i64,
}

/// Spawn the wall-clock killer. It sleeps through the budget once and stops
/// the child if it is still alive afterwards.
pub fn spawn_wall_clock_killer(pid: Pid, max_cpu_time_ms: i64) -> std::io::Result<()> {
    let handle = KillerHandle { pid, limit: max_cpu_time_ms };
    std::thread::Builder::new()
        .name("wall-clock-killer".to_owned())
        .spawn(move || wall_clock_killer(handle))
        .map(|_| ())
}

/// Spawn the resident-set killer polling `/proc/<pid>/statm`.
pub fn spawn_memory_killer(pid: Pid, max_memory_kib: i64) -> std::io::Result<()> {
    let handle = KillerHandle { pid, limit: max_memory_kib };
    std::thread::Builder::new()
        .name("memory-killer".to_owned())
        .spawn(move || memory_killer(handle))
        .map(|_| ())
}

/// Spawn the thread-count killer polling `/proc/<pid>/status`.
pub fn spawn_thread_killer(pid: Pid, max_thread: i64) -> std::io::Result<()> {
    let handle = KillerHandle { pid, limit: max_thread };
    std::thread::Builder::new()
        .name("thread-killer".to_owned())
        .spawn(move || thread_killer(handle))
        .map(|_| ())
}

fn wall_clock_killer(handle: KillerHandle) {
    let budget_ms = handle.limit + WALL_CLOCK_GRACE_MS;
    let budget = libc::timespec {
        tv_sec: budget_ms / 1000,
        tv_nsec: (budget_ms % 1000) * 1_000_000,
    };

    // A single nanosleep; std::thread::sleep would transparently retry an
    // interrupted sleep, and the interruption must stay observable here.
    let interrupted = unsafe { libc::nanosleep(&budget, std::ptr::null_mut()) } != 0;

    if !misc::process_alive(handle.pid) {
        return;
    }

    if interrupted {
        log::warn!("wall clock killer woken early, killing pid {}", handle.pid);
        let _ = kill(handle.pid, Signal::SIGKILL);
    } else {
        // SIGSTOP surfaces as a stopped wait status, which the supervisor
        // classifies as the wall-clock budget running out.
        log::debug!("wall clock budget of {} ms exhausted, stopping pid {}",
            handle.limit, handle.pid);
        let _ = kill(handle.pid, Signal::SIGSTOP);
    }
}

fn memory_killer(handle: KillerHandle) {
    let page_kib = misc::page_size_kib();

    loop {
        match procinfo::pid::statm(handle.pid.as_raw()) {
            Ok(statm) => {
                let resident_kib = statm.resident as i64 * page_kib;
                if resident_kib > handle.limit {
                    log::debug!("pid {} resident set {} KiB over limit {} KiB",
                        handle.pid, resident_kib, handle.limit);
                    let _ = kill(handle.pid, Signal::SIGSEGV);
                }
            },
            Err(..) => {
                if !misc::process_alive(handle.pid) {
                    return;
                }
            },
        };

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn thread_killer(handle: KillerHandle) {
    loop {
        match procinfo::pid::status(handle.pid.as_raw()) {
            Ok(status) => {
                if i64::from(status.threads) > handle.limit {
                    log::debug!("pid {} running {} threads over limit {}",
                        handle.pid, status.threads, handle.limit);
                    let _ = kill(handle.pid, Signal::SIGKILL);
                }
            },
            Err(..) => {
                if !misc::process_alive(handle.pid) {
                    return;
                }
            },
        };

        std::thread::sleep(POLL_INTERVAL);
    }
}
