//! This module contains facilities that relate to the seccomp feature of Linux
//! systems. This module is based on the `seccomp_sys` crate which furthur
//! depends on the `libseccomp` native library.
//!
//! Three predefined filter profiles are available:
//!
//! * `compile`: lenient profile for compiler invocations;
//! * `gentle`: blacklist profile for interpreters and user code that may
//! legitimately fork or open files;
//! * `strict`: whitelist profile for compiled user code under judge.
//!
//! Use [`install`] to load one of the profiles into the calling thread before
//! `execve`.
//!

use std::error::Error;
use std::ffi::{CStr, CString};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use seccomp_sys::*;


/// The error type used in `seccomp` module.
#[derive(Clone, Copy, Debug)]
pub struct SeccompError {
    errno: i32,
}

impl SeccompError {
    /// Create a new `SeccompError` instance.
    pub fn new(errno: i32) -> Self {
        SeccompError { errno }
    }

    /// Get the error number returned by the underlying `libseccomp` library.
    pub fn errno(&self) -> i32 {
        self.errno
    }
}

impl Display for SeccompError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("seccomp error: {}", self.errno))
    }
}

impl Error for SeccompError {
    // Use default trait implementation here.
}

/// The result type used in `seccomp` module.
pub type Result<T> = std::result::Result<T, SeccompError>;

/// Represent the action to take on specific syscall.
#[derive(Clone, Copy, Debug)]
#[allow(dead_code)]
pub enum Action {
    /// Allow the syscall.
    Allow,

    /// Kill the calling thread immediately, as though it is been killed by the delivery of a
    /// `SIGSYS` signal.
    KillThread,

    /// Kill the calling process immediately.
    KillProcess,

    /// Send a `SIGSYS` signal to the calling thread.
    Trap,

    /// The called syscall immediately returns with the specified return value.
    Errno(u32),

    /// Notifying any tracing thread with the specified value.
    Trace(u32),
}

impl Action {
    /// Convert the `Action` enum value into native, libseccomp compatible format.
    pub fn as_native(&self) -> u32 {
        match self {
            Action::Allow => SCMP_ACT_ALLOW,
            Action::KillThread => SCMP_ACT_KILL,
            Action::KillProcess => SCMP_ACT_KILL_PROCESS,
            Action::Trap => SCMP_ACT_TRAP,
            Action::Errno(errno) => SCMP_ACT_ERRNO(*errno),
            Action::Trace(sig) => SCMP_ACT_TRACE(*sig),
        }
    }
}

/// A system call known by name. The native syscall number is resolved against
/// the architecture of the calling process when a rule is added.
#[derive(Clone, Copy, Debug)]
pub struct SystemCall(&'static str);

impl SystemCall {
    /// Resolve the native syscall number of this system call. Returns `None`
    /// if the native architecture does not provide the syscall (e.g.
    /// `chown32` on x86-64).
    fn number(&self) -> Option<i32> {
        let name = CString::new(self.0).ok()?;
        let ret = unsafe { seccomp_syscall_resolve_name(name.as_ptr()) };
        if ret < 0 {
            None
        } else {
            Some(ret)
        }
    }
}

impl Display for SystemCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// One of the predefined syscall filter profiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterProfile {
    /// Lenient blacklist for compiler processes.
    Compile,

    /// Extended blacklist for interpreters and user code that needs to fork
    /// or open files.
    Gentle,

    /// Whitelist for compiled user code; everything not explicitly allowed
    /// kills the process.
    Strict,
}

impl FilterProfile {
    /// Get the canonical name of the profile.
    pub fn name(self) -> &'static str {
        match self {
            FilterProfile::Compile => "compile",
            FilterProfile::Gentle => "gentle",
            FilterProfile::Strict => "strict",
        }
    }
}

impl Display for FilterProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilterProfile {
    type Err = crate::Error;

    /// Parse a profile name. The historical `low` / `mid` / `high` names are
    /// accepted as synonyms.
    fn from_str(name: &str) -> crate::Result<FilterProfile> {
        match name {
            "compile" | "low" => Ok(FilterProfile::Compile),
            "gentle" | "mid" => Ok(FilterProfile::Gentle),
            "strict" | "high" => Ok(FilterProfile::Strict),
            _ => Err(crate::ErrorKind::UnknownFilterProfile(name.to_owned()).into()),
        }
    }
}

/// Syscalls denied to compiler processes.
const COMPILE_DENIED_SYSCALLS: &[SystemCall] = &[
    SystemCall("socket"),
    SystemCall("setuid"), SystemCall("setgid"),
    SystemCall("setpgid"), SystemCall("setsid"),
    SystemCall("setreuid"), SystemCall("setregid"),
    SystemCall("setgroups"), SystemCall("setrlimit"),
    SystemCall("seccomp"),
];

/// Additional syscalls denied by the gentle profile, on top of the compile
/// blacklist.
const GENTLE_DENIED_SYSCALLS: &[SystemCall] = &[
    SystemCall("vfork"), SystemCall("fork"),
    SystemCall("chmod"), SystemCall("fchmod"),
    SystemCall("chown"), SystemCall("chown32"),
    SystemCall("fchown"), SystemCall("fchownat"),
    SystemCall("link"), SystemCall("shutdown"),
    SystemCall("rmdir"), SystemCall("rename"),
];

/// The only syscalls available to processes running under the strict profile.
const STRICT_ALLOWED_SYSCALLS: &[SystemCall] = &[
    // file system (IO)
    SystemCall("read"), SystemCall("write"),
    SystemCall("readv"), SystemCall("writev"),
    SystemCall("close"), SystemCall("readlink"),
    SystemCall("flock"), SystemCall("fcntl"),
    SystemCall("fstat"), SystemCall("lstat"),
    SystemCall("access"), SystemCall("lseek"),
    SystemCall("fsync"), SystemCall("getdents"),

    // system info
    SystemCall("uname"), SystemCall("getrusage"),
    SystemCall("sysinfo"), SystemCall("getrlimit"),
    SystemCall("time"), SystemCall("getcwd"),
    SystemCall("clock_gettime"),

    // memory
    SystemCall("mmap"), SystemCall("munmap"),
    SystemCall("mremap"), SystemCall("brk"),
    SystemCall("mprotect"), SystemCall("madvise"),

    // process control
    SystemCall("prctl"), SystemCall("arch_prctl"),
    SystemCall("exit_group"), SystemCall("exit"),
    SystemCall("rt_sigprocmask"), SystemCall("sigprocmask"),
    SystemCall("rt_sigaction"), SystemCall("sigaction"),
    SystemCall("prlimit64"), SystemCall("getpid"),

    // misc
    SystemCall("poll"), SystemCall("stat"),
    SystemCall("getrandom"),
];

/// An in-construction syscall filter wrapping a native libseccomp context.
struct Filter {
    ctx: *mut scmp_filter_ctx,
}

impl Filter {
    /// Create a new filter with the given default action.
    fn new(default_action: Action) -> Result<Filter> {
        let ctx = unsafe { seccomp_init(default_action.as_native()) };
        if ctx.is_null() {
            return Err(SeccompError::new(-1));
        }
        Ok(Filter { ctx })
    }

    /// Add an unconditional rule for the given syscall. A syscall the native
    /// architecture does not provide cannot be issued at all and is skipped.
    fn add_rule(&mut self, action: Action, syscall: SystemCall) -> Result<()> {
        let number = match syscall.number() {
            Some(number) => number,
            None => {
                log::debug!("syscall {} unavailable on this architecture, rule skipped", syscall);
                return Ok(());
            },
        };

        let ret = unsafe {
            seccomp_rule_add_array(
                self.ctx, action.as_native(), number, 0, std::ptr::null())
        };
        if ret < 0 {
            return Err(SeccompError::new(ret));
        }

        Ok(())
    }

    /// Add a rule that fires only when every given argument comparison holds.
    fn add_rule_with_args(&mut self, action: Action, syscall: SystemCall,
        cmps: &[scmp_arg_cmp]) -> Result<()> {
        let number = match syscall.number() {
            Some(number) => number,
            None => {
                log::debug!("syscall {} unavailable on this architecture, rule skipped", syscall);
                return Ok(());
            },
        };

        let ret = unsafe {
            seccomp_rule_add_array(
                self.ctx, action.as_native(), number, cmps.len() as u32, cmps.as_ptr())
        };
        if ret < 0 {
            return Err(SeccompError::new(ret));
        }

        Ok(())
    }

    /// Load the filter into the kernel for the calling thread.
    fn load(&self) -> Result<()> {
        let ret = unsafe { seccomp_load(self.ctx) };
        if ret < 0 {
            return Err(SeccompError::new(ret));
        }

        Ok(())
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        unsafe { seccomp_release(self.ctx) };
    }
}

/// Comparison requiring syscall argument `arg` to differ from `datum`.
fn cmp_ne(arg: u32, datum: u64) -> scmp_arg_cmp {
    scmp_arg_cmp {
        arg,
        op: scmp_compare::SCMP_CMP_NE,
        datum_a: datum,
        datum_b: 0,
    }
}

/// Comparison requiring syscall argument `arg` to equal `datum`.
fn cmp_eq(arg: u32, datum: u64) -> scmp_arg_cmp {
    scmp_arg_cmp {
        arg,
        op: scmp_compare::SCMP_CMP_EQ,
        datum_a: datum,
        datum_b: 0,
    }
}

/// Comparison requiring syscall argument `arg`, masked with `mask`, to equal
/// `datum`.
fn cmp_masked_eq(arg: u32, mask: u64, datum: u64) -> scmp_arg_cmp {
    scmp_arg_cmp {
        arg,
        op: scmp_compare::SCMP_CMP_MASKED_EQ,
        datum_a: mask,
        datum_b: datum,
    }
}

/// Install the filter selected by `profile` into the calling thread.
///
/// `exec_path` must be the exact C string whose address is later passed to
/// `execve`: the gentle and strict profiles permit `execve` by comparing the
/// syscall's path argument against this string's address.
pub fn install(profile: FilterProfile, exec_path: &CStr) -> Result<()> {
    match profile {
        FilterProfile::Compile => install_compile(),
        FilterProfile::Gentle => install_gentle(exec_path),
        FilterProfile::Strict => install_strict(exec_path),
    }
}

fn install_compile() -> Result<()> {
    let mut filter = Filter::new(Action::Allow)?;
    for syscall in COMPILE_DENIED_SYSCALLS {
        filter.add_rule(Action::KillThread, *syscall)?;
    }

    filter.load()
}

fn install_gentle(exec_path: &CStr) -> Result<()> {
    let mut filter = Filter::new(Action::Allow)?;
    for syscall in COMPILE_DENIED_SYSCALLS.iter().chain(GENTLE_DENIED_SYSCALLS) {
        filter.add_rule(Action::KillThread, *syscall)?;
    }

    // Kill any execve whose path argument is not the target binary.
    filter.add_rule_with_args(Action::KillThread, SystemCall("execve"),
        &[cmp_ne(0, exec_path.as_ptr() as u64)])?;

    // Kill write-capable opens.
    let wronly = libc::O_WRONLY as u64;
    let rdwr = libc::O_RDWR as u64;
    filter.add_rule_with_args(Action::KillThread, SystemCall("open"),
        &[cmp_masked_eq(1, wronly, wronly)])?;
    filter.add_rule_with_args(Action::KillThread, SystemCall("open"),
        &[cmp_masked_eq(1, rdwr, rdwr)])?;
    filter.add_rule_with_args(Action::KillThread, SystemCall("openat"),
        &[cmp_masked_eq(2, wronly, wronly)])?;
    filter.add_rule_with_args(Action::KillThread, SystemCall("openat"),
        &[cmp_masked_eq(2, rdwr, rdwr)])?;

    filter.load()
}

fn install_strict(exec_path: &CStr) -> Result<()> {
    let mut filter = Filter::new(Action::KillThread)?;
    for syscall in STRICT_ALLOWED_SYSCALLS {
        filter.add_rule(Action::Allow, *syscall)?;
    }

    // execve is allowed for the target binary only.
    filter.add_rule_with_args(Action::Allow, SystemCall("execve"),
        &[cmp_eq(0, exec_path.as_ptr() as u64)])?;

    // Opens are allowed only when neither write bit is set in the flags.
    let write_bits = (libc::O_WRONLY | libc::O_RDWR) as u64;
    filter.add_rule_with_args(Action::Allow, SystemCall("open"),
        &[cmp_masked_eq(1, write_bits, 0)])?;
    filter.add_rule_with_args(Action::Allow, SystemCall("openat"),
        &[cmp_masked_eq(2, write_bits, 0)])?;

    filter.load()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::FilterProfile;

    #[test]
    fn test_profile_from_canonical_name() {
        assert_eq!(FilterProfile::Compile, FilterProfile::from_str("compile").unwrap());
        assert_eq!(FilterProfile::Gentle, FilterProfile::from_str("gentle").unwrap());
        assert_eq!(FilterProfile::Strict, FilterProfile::from_str("strict").unwrap());
    }

    #[test]
    fn test_profile_from_historical_name() {
        assert_eq!(FilterProfile::Compile, FilterProfile::from_str("low").unwrap());
        assert_eq!(FilterProfile::Gentle, FilterProfile::from_str("mid").unwrap());
        assert_eq!(FilterProfile::Strict, FilterProfile::from_str("high").unwrap());
    }

    #[test]
    fn test_profile_from_unknown_name() {
        assert!(FilterProfile::from_str("").is_err());
        assert!(FilterProfile::from_str("lenient").is_err());
    }

    #[test]
    fn test_profile_name_round_trip() {
        for &profile in &[FilterProfile::Compile, FilterProfile::Gentle, FilterProfile::Strict] {
            assert_eq!(profile, FilterProfile::from_str(profile.name()).unwrap());
        }
    }
}
