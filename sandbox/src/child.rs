//! Child-side initialization.
//!
//! Everything in this module runs in the forked child, between `fork` and
//! `execve`. The steps are ordered: resource limits first, then stream
//! redirections, then the privilege drop, and the syscall filter last, after
//! every syscall the setup itself needs has already been issued. Any failure
//! logs its reason and exits the child with [`CHILD_FAIL`]; the supervisor
//! observes that as a plain non-zero exit.
//!

use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::os::unix::io::AsRawFd;

use nix::unistd::{setgid, setuid, Gid, Uid};

use crate::misc;
use crate::rlimits::{self, Resource, ResourceLimit};
use crate::seccomp;
use crate::{RuntimeConfig, STDERR_SENTINEL, STDIN_SENTINEL, STDOUT_SENTINEL};

/// Exit status of a child that failed during setup. Distinctive on purpose:
/// next to target programs exiting 1, a 187 in the log points at the sandbox
/// itself.
pub const CHILD_FAIL: i32 = 187;

/// Upper bound on the argv and envp arrays handed to exec, including the
/// terminating entries contributed by `exec_path`.
const MAX_ARGS: usize = 128;

/// Process limit installed after a privilege drop so the unprivileged
/// identity cannot fork-bomb the host.
const NPROC_AFTER_DROP: ResourceLimit = ResourceLimit {
    soft_limit: 512,
    hard_limit: 768,
};

/// Why the child could not reach `execve`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SetupError {
    CpuLimit,
    MemoryLimit,
    StackLimit,
    OutputLimit,
    OpenFileLimit,
    OpenInput,
    MountInput,
    OpenOutput,
    MountOutput,
    OpenError,
    MountError,
    SetGid,
    SetUid,
    ProcessLimit,
    BadArgument,
    FilterLoad,
    Exec,
}

impl Display for SetupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SetupError::CpuLimit => "cannot set cpu time limit",
            SetupError::MemoryLimit => "cannot set address space limit",
            SetupError::StackLimit => "cannot set stack limit",
            SetupError::OutputLimit => "cannot set output size limit",
            SetupError::OpenFileLimit => "cannot set open file limit",
            SetupError::OpenInput => "cannot open input file",
            SetupError::MountInput => "cannot mount input file onto stdin",
            SetupError::OpenOutput => "cannot open output file",
            SetupError::MountOutput => "cannot mount output file onto stdout",
            SetupError::OpenError => "cannot open error file",
            SetupError::MountError => "cannot mount error file onto stderr",
            SetupError::SetGid => "cannot set group id",
            SetupError::SetUid => "cannot set user id",
            SetupError::ProcessLimit => "cannot set process count limit",
            SetupError::BadArgument => "argument is not a valid C string",
            SetupError::FilterLoad => "cannot load seccomp filter",
            SetupError::Exec => "exec failed",
        };
        f.write_str(reason)
    }
}

/// Entry point of the forked child. Applies the execution environment
/// described by `config` and hands control to the target binary. Never
/// returns: ends inside exec, or in a `CHILD_FAIL` exit after logging the
/// failure reason.
pub fn initialize(config: &RuntimeConfig) -> ! {
    let err = match setup_and_exec(config) {
        Ok(never) => match never {},
        Err(err) => err,
    };

    log::error!("child process exit because: {}", err);
    std::process::exit(CHILD_FAIL)
}

fn setup_and_exec(config: &RuntimeConfig) -> Result<Infallible, SetupError> {
    apply_rlimits(config)?;

    // The redirect files stay open until exec; the CLOEXEC flag set while
    // mounting closes the original descriptors in the exec'ed image.
    let _redirects = apply_redirections(config)?;

    apply_identity(config)?;

    let exec_path = CString::new(config.exec_path.as_bytes())
        .map_err(|_| SetupError::BadArgument)?;
    let argv = build_argv(&exec_path, &config.exec_args)?;
    let envp = build_envp(&config.exec_env)?;

    // The filter goes in last: every syscall the setup needed has run, and
    // the exec_path C string the filter compares against is the one exec
    // will receive.
    if let Some(profile) = config.scmp_name {
        log::debug!("loading {} seccomp profile", profile);
        seccomp::install(profile, exec_path.as_c_str())
            .map_err(|_| SetupError::FilterLoad)?;
    }

    exec(&exec_path, &argv, envp.as_ref().map(Vec::as_slice));
    Err(SetupError::Exec)
}

fn apply_rlimits(config: &RuntimeConfig) -> Result<(), SetupError> {
    if let Some(ms) = config.max_cpu_time {
        log::debug!("cpu time limit: {} ms", ms);
        rlimits::setrlimit_hard(Resource::CpuTime, rlimits::cpu_limit_seconds(ms))
            .map_err(|_| SetupError::CpuLimit)?;
    }

    if config.use_rlimit_to_limit_memory {
        if let Some(kib) = config.max_memory {
            log::debug!("memory limited through rlimit: {} KiB of address space", kib);
            rlimits::setrlimit_hard(Resource::AddressSpace, kib as u64 * 1024)
                .map_err(|_| SetupError::MemoryLimit)?;
        }
    }

    if let Some(kib) = config.max_stack {
        log::debug!("stack limit: {} KiB", kib);
        rlimits::setrlimit_hard(Resource::Stack, kib as u64 * 1024)
            .map_err(|_| SetupError::StackLimit)?;
    }

    if let Some(bytes) = config.max_output_size {
        log::debug!("output limit: {} bytes", bytes);
        rlimits::setrlimit_hard(Resource::FileSize, bytes as u64)
            .map_err(|_| SetupError::OutputLimit)?;
    }

    if let Some(count) = config.max_open_file_number {
        log::debug!("open file limit: {}", count);
        rlimits::setrlimit_hard(Resource::OpenFiles, count as u64)
            .map_err(|_| SetupError::OpenFileLimit)?;
    }

    Ok(())
}

/// Mount the configured redirect files onto the standard streams. The
/// returned files keep the descriptors alive until exec.
fn apply_redirections(config: &RuntimeConfig)
    -> Result<Vec<File>, SetupError> {
    let mut opened = Vec::new();

    if config.input_path != STDIN_SENTINEL {
        log::debug!("redirecting stdin from {}", config.input_path);
        let file = File::open(&config.input_path)
            .map_err(|_| SetupError::OpenInput)?;
        misc::dup_and_cloexec(file.as_raw_fd(), libc::STDIN_FILENO)
            .map_err(|_| SetupError::MountInput)?;
        opened.push(file);
    }

    if config.output_path != STDOUT_SENTINEL {
        log::debug!("redirecting stdout to {}", config.output_path);
        let file = File::create(&config.output_path)
            .map_err(|_| SetupError::OpenOutput)?;
        misc::dup_and_cloexec(file.as_raw_fd(), libc::STDOUT_FILENO)
            .map_err(|_| SetupError::MountOutput)?;
        opened.push(file);
    }

    if config.error_path != STDERR_SENTINEL {
        log::debug!("redirecting stderr to {}", config.error_path);
        let file = File::create(&config.error_path)
            .map_err(|_| SetupError::OpenError)?;
        misc::dup_and_cloexec(file.as_raw_fd(), libc::STDERR_FILENO)
            .map_err(|_| SetupError::MountError)?;
        opened.push(file);
    }

    Ok(opened)
}

/// Drop to the configured identity. Group first: setgid is no longer
/// permitted once the uid has been given up.
fn apply_identity(config: &RuntimeConfig) -> Result<(), SetupError> {
    if let Some(gid) = config.gid {
        log::debug!("set gid as: {}", gid);
        setgid(Gid::from_raw(gid)).map_err(|_| SetupError::SetGid)?;
    }

    if let Some(uid) = config.uid {
        log::debug!("set uid as: {}", uid);
        setuid(Uid::from_raw(uid)).map_err(|_| SetupError::SetUid)?;
    }

    if config.uid.is_some() || config.gid.is_some() {
        rlimits::setrlimit(Resource::ProcessCount, &NPROC_AFTER_DROP)
            .map_err(|_| SetupError::ProcessLimit)?;
    }

    Ok(())
}

/// Build argv for exec: the target path followed by the space-split
/// arguments, capped at [`MAX_ARGS`] entries.
fn build_argv(exec_path: &CString, exec_args: &str)
    -> Result<Vec<CString>, SetupError> {
    let mut argv = vec![exec_path.clone()];
    for word in misc::split_words(exec_args).take(MAX_ARGS - 1) {
        argv.push(CString::new(word).map_err(|_| SetupError::BadArgument)?);
    }

    Ok(argv)
}

/// Build envp for exec, or `None` when the parent environment should be
/// inherited.
fn build_envp(exec_env: &str) -> Result<Option<Vec<CString>>, SetupError> {
    if exec_env.is_empty() {
        return Ok(None);
    }

    let mut envp = Vec::new();
    for word in misc::split_words(exec_env).take(MAX_ARGS) {
        envp.push(CString::new(word).map_err(|_| SetupError::BadArgument)?);
    }

    Ok(Some(envp))
}

/// Hand control to the target binary. With an explicit environment the
/// `execvpe` variant is used, otherwise `execvp`; both only return on error.
fn exec(path: &CStr, argv: &[CString], envp: Option<&[CString]>) {
    let mut argv_ptrs = argv.iter()
        .map(|arg| arg.as_ptr())
        .collect::<Vec<*const libc::c_char>>();
    argv_ptrs.push(std::ptr::null());

    match envp {
        Some(envp) => {
            let mut envp_ptrs = envp.iter()
                .map(|env| env.as_ptr())
                .collect::<Vec<*const libc::c_char>>();
            envp_ptrs.push(std::ptr::null());

            unsafe {
                libc::execvpe(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            }
        },
        None => {
            unsafe {
                libc::execvp(path.as_ptr(), argv_ptrs.as_ptr());
            }
        },
    };
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::{build_argv, build_envp, SetupError, MAX_ARGS};

    #[test]
    fn test_build_argv_prepends_exec_path() {
        let path = CString::new("/usr/bin/cc").unwrap();
        let argv = build_argv(&path, "-O2  -o a.out").unwrap();

        assert_eq!(4, argv.len());
        assert_eq!(path, argv[0]);
        assert_eq!(CString::new("-O2").unwrap(), argv[1]);
        assert_eq!(CString::new("-o").unwrap(), argv[2]);
        assert_eq!(CString::new("a.out").unwrap(), argv[3]);
    }

    #[test]
    fn test_build_argv_caps_entries() {
        let path = CString::new("/bin/true").unwrap();
        let args = vec!["x"; MAX_ARGS * 2].join(" ");
        let argv = build_argv(&path, &args).unwrap();

        assert_eq!(MAX_ARGS, argv.len());
    }

    #[test]
    fn test_build_argv_rejects_interior_nul() {
        let path = CString::new("/bin/true").unwrap();
        let err = build_argv(&path, "a\x00b").unwrap_err();

        assert_eq!(SetupError::BadArgument, err);
    }

    #[test]
    fn test_build_envp_empty_means_inherit() {
        assert!(build_envp("").unwrap().is_none());
    }

    #[test]
    fn test_build_envp_splits_words() {
        let envp = build_envp("PATH=/usr/bin LANG=C").unwrap().unwrap();

        assert_eq!(2, envp.len());
        assert_eq!(CString::new("PATH=/usr/bin").unwrap(), envp[0]);
        assert_eq!(CString::new("LANG=C").unwrap(), envp[1]);
    }
}
