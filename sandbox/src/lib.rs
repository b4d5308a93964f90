//! This crate implements a process sandbox for online-judge workloads. The
//! sandbox executes one untrusted program under strict resource ceilings and
//! reports a structured verdict about the run.
//!
//! The sandbox implements:
//!
//! * Resource limits: CPU time, address space, stack, output size and open
//! file count, enforced through the kernel `rlimit` mechanism;
//!
//! * Monitor threads: live ceilings the kernel does not enforce precisely on
//! its own (wall-clock budget, resident-set size, thread count);
//!
//! * Redirections: wires stdin, stdout and stderr of the child process to
//! caller-named files;
//!
//! * Privilege drop: runs the child under an unprivileged uid/gid;
//!
//! * Process syscall filter: one of three predefined seccomp profiles
//! installed ahead of `execve`.
//!
//! The entry point is [`run`]: it validates the configuration, forks the
//! child, supervises it to completion and classifies the outcome into a
//! [`Verdict`].
//!

#[macro_use]
extern crate error_chain;
extern crate chrono;
extern crate libc;
extern crate log;
extern crate nix;
extern crate procinfo;
extern crate seccomp_sys;

#[cfg(feature = "serde")]
extern crate serde;


mod child;
mod misc;
mod monitor;
mod rlimits;
mod seccomp;

pub mod logger;

use std::fmt::{Display, Formatter};
use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{ForkResult, Pid};

pub use child::CHILD_FAIL;
pub use seccomp::FilterProfile;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
        Seccomp(seccomp::SeccompError);
    }

    errors {
        InvalidLimit(name: &'static str) {
            description("limit out of range")
            display("limit {} must be at least 1 when set", name)
        }

        RootRequired {
            description("changing the child uid or gid requires root")
        }

        UnknownFilterProfile(name: String) {
            description("unknown seccomp filter profile")
            display("unknown seccomp filter profile: {}", name)
        }

        MonitorSpawnFailed {
            description("failed to spawn a monitor thread")
        }

        WaitFailed {
            description("failed to wait for the child process")
        }
    }
}


/// Path sentinel meaning "do not redirect stdin".
pub const STDIN_SENTINEL: &str = "/dev/stdin";

/// Path sentinel meaning "do not redirect stdout".
pub const STDOUT_SENTINEL: &str = "/dev/stdout";

/// Path sentinel meaning "do not redirect stderr".
pub const STDERR_SENTINEL: &str = "/dev/stderr";

/// Thread ceiling enforced when the caller did not name one.
const DEFAULT_MAX_THREAD: i64 = 8;

/// Describe one sandboxed run. The supervisor treats the configuration as
/// read-only; it is shared as-is with the monitor threads and, through fork,
/// with the child.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// CPU time budget in milliseconds. The wall-clock budget mirrors it.
    pub max_cpu_time: Option<i64>,

    /// Stack ceiling in KiB.
    pub max_stack: Option<i64>,

    /// Memory ceiling in KiB. Enforced by the resident-set monitor, or by
    /// the kernel address-space limit when `use_rlimit_to_limit_memory` is
    /// set.
    pub max_memory: Option<i64>,

    /// Output ceiling in bytes; overruns surface as `SIGXFSZ`.
    pub max_output_size: Option<i64>,

    /// Open file descriptor ceiling.
    pub max_open_file_number: Option<i64>,

    /// Thread count ceiling; the monitor uses 8 when unset.
    pub max_thread: Option<i64>,

    /// Path to the target binary.
    pub exec_path: String,

    /// Space-separated arguments, excluding argv[0]. No quoting: an argument
    /// with embedded spaces cannot be expressed.
    pub exec_args: String,

    /// Space-separated `KEY=VALUE` environment. Empty means inherit the
    /// supervisor environment.
    pub exec_env: String,

    /// stdin redirect; [`STDIN_SENTINEL`] leaves the stream alone.
    pub input_path: String,

    /// stdout redirect; [`STDOUT_SENTINEL`] leaves the stream alone.
    pub output_path: String,

    /// stderr redirect; [`STDERR_SENTINEL`] leaves the stream alone.
    pub error_path: String,

    /// Uid to drop to before exec.
    pub uid: Option<u32>,

    /// Gid to drop to before exec. Applied ahead of the uid drop.
    pub gid: Option<u32>,

    /// Seccomp profile installed right before exec.
    pub scmp_name: Option<FilterProfile>,

    /// Enforce the memory ceiling through `RLIMIT_AS` instead of the
    /// resident-set monitor.
    pub use_rlimit_to_limit_memory: bool,
}

impl RuntimeConfig {
    /// Create a configuration running the given binary with no limits, no
    /// redirections, no identity change and no syscall filter.
    pub fn new<T: Into<String>>(exec_path: T) -> RuntimeConfig {
        RuntimeConfig {
            max_cpu_time: None,
            max_stack: None,
            max_memory: None,
            max_output_size: None,
            max_open_file_number: None,
            max_thread: None,
            exec_path: exec_path.into(),
            exec_args: String::new(),
            exec_env: String::new(),
            input_path: STDIN_SENTINEL.to_owned(),
            output_path: STDOUT_SENTINEL.to_owned(),
            error_path: STDERR_SENTINEL.to_owned(),
            uid: None,
            gid: None,
            scmp_name: None,
            use_rlimit_to_limit_memory: false,
        }
    }

    /// Check that every limit that is set is at least 1.
    pub fn validate(&self) -> Result<()> {
        let limits: [(&'static str, Option<i64>); 6] = [
            ("max_cpu_time", self.max_cpu_time),
            ("max_stack", self.max_stack),
            ("max_memory", self.max_memory),
            ("max_output_size", self.max_output_size),
            ("max_open_file_number", self.max_open_file_number),
            ("max_thread", self.max_thread),
        ];
        for &(name, value) in &limits {
            if let Some(value) = value {
                if value < 1 {
                    bail!(ErrorKind::InvalidLimit(name));
                }
            }
        }

        Ok(())
    }
}

/// The categorical outcome assigned to a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The program exited normally with status 0.
    SuccessExit = 0,

    /// The CPU or wall-clock budget ran out.
    TimeLimitExceeded = 1,

    /// The resident-set ceiling was breached.
    MemoryLimitExceeded = 2,

    /// The output ceiling was breached.
    OutputLimitExceeded = 3,

    /// The program crashed or exited non-zero.
    RuntimeError = 4,

    /// The program issued a syscall the filter forbids.
    RuntimeErrorBadSyscall = 5,

    /// The sandbox itself failed; the run says nothing about the program.
    SystemError = 6,
}

impl Verdict {
    /// Get the stable numeric code of the verdict.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Get the stable name of the verdict.
    pub fn name(self) -> &'static str {
        match self {
            Verdict::SuccessExit => "SUCCESS_EXIT",
            Verdict::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Verdict::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Verdict::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            Verdict::RuntimeError => "RUNTIME_ERROR",
            Verdict::RuntimeErrorBadSyscall => "RUNTIME_ERROR_BAD_SYSCALL",
            Verdict::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl Default for Verdict {
    fn default() -> Verdict {
        Verdict::SuccessExit
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Measurements and verdict of one finished run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeResult {
    /// User plus system CPU time, in milliseconds.
    pub cpu_time: i64,

    /// Wall-clock time between fork and reap, in milliseconds.
    pub clock_time: i64,

    /// Peak resident set, in KiB.
    pub memory_use: i64,

    /// Exit code, when the child exited normally.
    pub exit_code: i32,

    /// Terminating signal, when the child was killed by one.
    pub signal: i32,

    /// Raw wait status as reported by the kernel.
    pub status: i32,

    /// The verdict assigned to the run.
    pub result: Verdict,
}

#[cfg(feature = "serde")]
impl serde::Serialize for RuntimeResult {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: serde::Serializer {
        use serde::ser::SerializeStruct;

        let mut record = serializer.serialize_struct("RuntimeResult", 8)?;
        record.serialize_field("CPU_TIME", &self.cpu_time)?;
        record.serialize_field("CLOCK_TIME", &self.clock_time)?;
        record.serialize_field("MEMORY", &self.memory_use)?;
        record.serialize_field("STATUS", &self.status)?;
        record.serialize_field("SIGNAL", &self.signal)?;
        record.serialize_field("EXIT_CODE", &self.exit_code)?;
        record.serialize_field("RESULT_CODE", &self.result.code())?;
        record.serialize_field("RESULT", &self.result.name())?;
        record.end()
    }
}

/// Execute one sandboxed run and wait for its verdict.
///
/// Any verdict, including time, memory and runtime failures of the target
/// program, is an `Ok` result. `Err` is reserved for failures of the
/// sandbox itself: invalid configuration, missing root privilege for an
/// identity change, or fork/monitor/wait errors.
///
/// The call is synchronous and not re-entrant within one process: it forks
/// exactly one child and reaps it exactly once.
pub fn run(config: &RuntimeConfig) -> Result<RuntimeResult> {
    config.validate()?;

    if (config.uid.is_some() || config.gid.is_some())
        && !nix::unistd::geteuid().is_root() {
        bail!(ErrorKind::RootRequired);
    }

    match nix::unistd::fork()? {
        ForkResult::Child => child::initialize(config),
        ForkResult::Parent { child } => supervise(config, child),
    }
}

fn supervise(config: &RuntimeConfig, pid: Pid) -> Result<RuntimeResult> {
    let start_at = Instant::now();

    spawn_monitors(config, pid)?;

    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    // Wait with usage collection, stopped children included: a SIGSTOP from
    // the wall-clock killer must surface here instead of blocking forever.
    let waited = unsafe {
        libc::wait4(pid.as_raw(), &mut status, libc::WUNTRACED, &mut rusage)
    };
    let clock_time = start_at.elapsed().as_millis() as i64;

    if waited < 0 {
        let err = std::io::Error::last_os_error();
        let _ = kill(pid, Signal::SIGKILL);
        return Err(Error::with_chain(err, ErrorKind::WaitFailed));
    }

    // A stopped status means the wall-clock killer fired and the child is
    // still alive in the stopped state. Put it down and finish the reap; the
    // stopped status is what classification wants to see.
    if libc::WIFSTOPPED(status) {
        let _ = kill(pid, Signal::SIGKILL);
        let mut ignored: libc::c_int = 0;
        unsafe { libc::wait4(pid.as_raw(), &mut ignored, 0, &mut rusage) };
    }

    let mut result = RuntimeResult::default();
    result.status = status;
    result.clock_time = clock_time;
    result.cpu_time = cpu_time_millis(&rusage);
    result.memory_use = rusage.ru_maxrss as i64;
    if libc::WIFSIGNALED(status) {
        result.signal = libc::WTERMSIG(status);
    } else if libc::WIFEXITED(status) {
        result.exit_code = libc::WEXITSTATUS(status);
    }
    result.result = classify(config, &result);

    log::debug!("run finished: {} (cpu {} ms, clock {} ms, rss {} KiB)",
        result.result, result.cpu_time, result.clock_time, result.memory_use);

    Ok(result)
}

/// Spawn the monitor threads for the given child. A spawn failure kills the
/// child before reporting, so the supervisor never leaves an unwatched
/// process behind.
fn spawn_monitors(config: &RuntimeConfig, pid: Pid) -> Result<()> {
    if let Some(ms) = config.max_cpu_time {
        monitor::spawn_wall_clock_killer(pid, ms)
            .map_err(|e| monitor_spawn_failed(e, pid))?;
    }

    if !config.use_rlimit_to_limit_memory {
        if let Some(kib) = config.max_memory {
            monitor::spawn_memory_killer(pid, kib)
                .map_err(|e| monitor_spawn_failed(e, pid))?;
        }
    }

    let thread_limit = config.max_thread
        .filter(|&limit| limit >= 1)
        .unwrap_or(DEFAULT_MAX_THREAD);
    monitor::spawn_thread_killer(pid, thread_limit)
        .map_err(|e| monitor_spawn_failed(e, pid))?;

    Ok(())
}

fn monitor_spawn_failed(err: std::io::Error, pid: Pid) -> Error {
    let _ = kill(pid, Signal::SIGKILL);
    Error::with_chain(err, ErrorKind::MonitorSpawnFailed)
}

/// Total CPU time recorded in a rusage, in milliseconds.
fn cpu_time_millis(rusage: &libc::rusage) -> i64 {
    (rusage.ru_utime.tv_sec + rusage.ru_stime.tv_sec) * 1000
        + (rusage.ru_utime.tv_usec + rusage.ru_stime.tv_usec) / 1000
}

/// Map the raw outcome of a reaped child onto a verdict. Rules are applied
/// in order and later rules override earlier ones; the function is pure so
/// the mapping can be tested without running anything.
fn classify(config: &RuntimeConfig, result: &RuntimeResult) -> Verdict {
    let mut verdict = Verdict::SuccessExit;

    if result.exit_code != 0 || result.signal != 0 || result.status != 0 {
        verdict = Verdict::RuntimeError;
    }

    if result.signal == Signal::SIGSYS as i32 {
        verdict = Verdict::RuntimeErrorBadSyscall;
    }

    if let Some(limit) = config.max_cpu_time {
        // A stopped status is the wall-clock killer's SIGSTOP.
        let stopped = libc::WIFSTOPPED(result.status)
            && libc::WSTOPSIG(result.status) == Signal::SIGSTOP as i32;
        if stopped || result.clock_time > limit || result.cpu_time > limit {
            verdict = Verdict::TimeLimitExceeded;
        }
    }

    if result.signal == Signal::SIGXFSZ as i32 {
        verdict = Verdict::OutputLimitExceeded;
    }

    if result.signal == Signal::SIGSEGV as i32 {
        if let Some(limit) = config.max_memory {
            if result.memory_use > limit {
                verdict = Verdict::MemoryLimitExceeded;
            }
        }
    }

    if result.signal == Signal::SIGUSR2 as i32 {
        verdict = Verdict::SystemError;
    }

    verdict
}


#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::{classify, cpu_time_millis, RuntimeConfig, RuntimeResult, Verdict};

    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn signaled(signal: Signal) -> i32 {
        signal as i32
    }

    fn stopped(signal: Signal) -> i32 {
        ((signal as i32) << 8) | 0x7f
    }

    fn result_with(status: i32, signal: i32, exit_code: i32) -> RuntimeResult {
        RuntimeResult {
            status,
            signal,
            exit_code,
            ..RuntimeResult::default()
        }
    }

    #[test]
    fn test_classify_clean_exit() {
        let config = RuntimeConfig::new("/bin/true");
        let result = result_with(0, 0, 0);

        assert_eq!(Verdict::SuccessExit, classify(&config, &result));
    }

    #[test]
    fn test_classify_nonzero_exit() {
        let config = RuntimeConfig::new("/bin/false");
        let result = result_with(exited(1), 0, 1);

        assert_eq!(Verdict::RuntimeError, classify(&config, &result));
    }

    #[test]
    fn test_classify_banned_syscall() {
        let config = RuntimeConfig::new("/bin/true");
        let result = result_with(
            signaled(Signal::SIGSYS), Signal::SIGSYS as i32, 0);

        assert_eq!(Verdict::RuntimeErrorBadSyscall, classify(&config, &result));
    }

    #[test]
    fn test_classify_stopped_child_is_time_limit() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_cpu_time = Some(1000);
        let result = result_with(stopped(Signal::SIGSTOP), 0, 0);

        // The canonical wall-clock sentinel status.
        assert_eq!(4991, stopped(Signal::SIGSTOP));
        assert_eq!(Verdict::TimeLimitExceeded, classify(&config, &result));
    }

    #[test]
    fn test_classify_slow_clock_is_time_limit() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_cpu_time = Some(1000);
        let mut result = result_with(0, 0, 0);
        result.clock_time = 1200;

        assert_eq!(Verdict::TimeLimitExceeded, classify(&config, &result));
    }

    #[test]
    fn test_classify_cpu_overrun_beats_banned_syscall() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_cpu_time = Some(1000);
        let mut result = result_with(
            signaled(Signal::SIGSYS), Signal::SIGSYS as i32, 0);
        result.cpu_time = 1500;

        assert_eq!(Verdict::TimeLimitExceeded, classify(&config, &result));
    }

    #[test]
    fn test_classify_no_time_limit_means_no_time_verdict() {
        let config = RuntimeConfig::new("/bin/true");
        let mut result = result_with(0, 0, 0);
        result.clock_time = 60_000;

        assert_eq!(Verdict::SuccessExit, classify(&config, &result));
    }

    #[test]
    fn test_classify_output_limit() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_cpu_time = Some(1000);
        config.max_output_size = Some(1024);
        let mut result = result_with(
            signaled(Signal::SIGXFSZ), Signal::SIGXFSZ as i32, 0);
        result.cpu_time = 2000;

        // Output overrun wins over the time overrun.
        assert_eq!(Verdict::OutputLimitExceeded, classify(&config, &result));
    }

    #[test]
    fn test_classify_segv_over_limit_is_memory_limit() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_memory = Some(65536);
        let mut result = result_with(
            signaled(Signal::SIGSEGV), Signal::SIGSEGV as i32, 0);
        result.memory_use = 80000;

        assert_eq!(Verdict::MemoryLimitExceeded, classify(&config, &result));
    }

    #[test]
    fn test_classify_segv_under_limit_is_runtime_error() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_memory = Some(65536);
        let mut result = result_with(
            signaled(Signal::SIGSEGV), Signal::SIGSEGV as i32, 0);
        result.memory_use = 1024;

        assert_eq!(Verdict::RuntimeError, classify(&config, &result));
    }

    #[test]
    fn test_classify_segv_without_memory_limit_is_runtime_error() {
        let config = RuntimeConfig::new("/bin/true");
        let mut result = result_with(
            signaled(Signal::SIGSEGV), Signal::SIGSEGV as i32, 0);
        result.memory_use = 1 << 20;

        assert_eq!(Verdict::RuntimeError, classify(&config, &result));
    }

    #[test]
    fn test_classify_sigusr2_overrides_everything() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_cpu_time = Some(1000);
        config.max_memory = Some(65536);
        let mut result = result_with(
            signaled(Signal::SIGUSR2), Signal::SIGUSR2 as i32, 0);
        result.cpu_time = 5000;
        result.memory_use = 1 << 20;

        assert_eq!(Verdict::SystemError, classify(&config, &result));
    }

    #[test]
    fn test_cpu_time_millis_sums_user_and_system() {
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        rusage.ru_utime.tv_sec = 1;
        rusage.ru_utime.tv_usec = 500_000;
        rusage.ru_stime.tv_usec = 600_000;

        assert_eq!(2100, cpu_time_millis(&rusage));
    }

    #[test]
    fn test_validate_rejects_non_positive_limits() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_memory = Some(0);
        assert!(config.validate().is_err());

        config.max_memory = Some(-5);
        assert!(config.validate().is_err());

        config.max_memory = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_unset_limits() {
        let config = RuntimeConfig::new("/bin/true");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_rejects_invalid_config_before_forking() {
        let mut config = RuntimeConfig::new("/bin/true");
        config.max_cpu_time = Some(0);

        assert!(super::run(&config).is_err());
    }

    #[test]
    fn test_verdict_codes_are_stable() {
        assert_eq!(0, Verdict::SuccessExit.code());
        assert_eq!(1, Verdict::TimeLimitExceeded.code());
        assert_eq!(2, Verdict::MemoryLimitExceeded.code());
        assert_eq!(3, Verdict::OutputLimitExceeded.code());
        assert_eq!(4, Verdict::RuntimeError.code());
        assert_eq!(5, Verdict::RuntimeErrorBadSyscall.code());
        assert_eq!(6, Verdict::SystemError.code());

        assert_eq!("RUNTIME_ERROR_BAD_SYSCALL", Verdict::RuntimeErrorBadSyscall.name());
    }
}
