//! This module provide Rust friendly bindings to the native `rlimit` mechanism.
//!

use libc::rlimit;

/// Represent a resource.
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum Resource {
    /// Maximum size of the process's virtual memory (address space). This
    /// variant corresponds to the `RLIMIT_AS` native constant.
    AddressSpace = libc::RLIMIT_AS,

    /// Limit, in seconds, on the amount of CPU time that the process can
    /// consume. This variant corresponds to the `RLIMIT_CPU` native constant.
    CpuTime = libc::RLIMIT_CPU,

    /// Maximum size of the process's stack, in bytes. This variant
    /// corresponds to the `RLIMIT_STACK` native constant.
    Stack = libc::RLIMIT_STACK,

    /// Maximum size of files that the process may create, in bytes. Writes
    /// past the limit deliver `SIGXFSZ`. This variant corresponds to the
    /// `RLIMIT_FSIZE` native constant.
    FileSize = libc::RLIMIT_FSIZE,

    /// Maximum number of file descriptors the process may keep open. This
    /// variant corresponds to the `RLIMIT_NOFILE` native constant.
    OpenFiles = libc::RLIMIT_NOFILE,

    /// Maximum number of processes that can be created for the real user ID
    /// of the process. This variant corresponds to the `RLIMIT_NPROC` native
    /// constant.
    ProcessCount = libc::RLIMIT_NPROC,
}

/// Specify the soft limit and the hard limit for some resource.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimit {
    /// The soft limit of the resource.
    pub soft_limit: u64,

    /// The hard limit of the resource.
    pub hard_limit: u64,
}

impl ResourceLimit {
    /// Convert the `ResourceLimit` structure into native representation.
    fn as_native(&self) -> rlimit {
        rlimit {
            rlim_cur: self.soft_limit,
            rlim_max: self.hard_limit,
        }
    }
}

/// Set resource limit for the calling process, using the native `rlimit` mechanism.
pub fn setrlimit(resource: Resource, limit: &ResourceLimit) -> std::io::Result<()> {
    let ret = unsafe { libc::setrlimit(resource as u32, &limit.as_native()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Set resource limit for the calling process. The soft limit and the hard
/// limit are both set to the given `limit` value.
pub fn setrlimit_hard(resource: Resource, limit: u64) -> std::io::Result<()> {
    setrlimit(resource, &ResourceLimit {
        soft_limit: limit,
        hard_limit: limit,
    })
}

/// Number of whole seconds the kernel CPU limit is set to for a millisecond
/// budget. Pads one extra second so the wall-clock monitor fires before the
/// kernel does.
pub fn cpu_limit_seconds(max_cpu_time_ms: i64) -> u64 {
    (max_cpu_time_ms as u64 + 1000) / 1000
}

#[cfg(test)]
mod tests {
    use super::cpu_limit_seconds;

    #[test]
    fn test_cpu_limit_seconds_pads_one_second() {
        assert_eq!(2, cpu_limit_seconds(1000));
        assert_eq!(1, cpu_limit_seconds(1));
        assert_eq!(2, cpu_limit_seconds(1500));
        assert_eq!(3, cpu_limit_seconds(2000));
    }
}
