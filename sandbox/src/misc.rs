use std::os::unix::io::RawFd;

use nix::fcntl::{FcntlArg, FdFlag};
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Check if the given string slice is a valid C-style string.
///
/// Formally, this function checks whether the byte sequence of the string slice contains any
/// b'\x00'. If so, this function returns `false`.
///
/// ```ignore
/// assert!(is_valid_c_string("abc哈哈哈"));
/// assert!(!is_valid_c_string("abc\x00哈哈哈"));
/// ```
///
pub fn is_valid_c_string(s: &str) -> bool {
    !s.as_bytes().contains(&b'\x00')
}

/// Split a space-separated value into its non-empty words. This is the only
/// splitting the argument and environment strings get: no quoting, no
/// escaping, consecutive spaces collapse.
pub fn split_words(s: &str) -> impl Iterator<Item = &str> {
    s.split(' ').filter(|word| !word.is_empty())
}

/// This function calls `dup2(old_fd, new_fd)` and set the `O_CLOEXEC` flag on the old file
/// descriptor. This function is useful when duplicating file descriptors for standard streams
/// that can effectively prevent the original file descriptors from leaking.
pub fn dup_and_cloexec(old_fd: RawFd, new_fd: RawFd) -> nix::Result<()> {
    nix::unistd::dup2(old_fd, new_fd)?;
    nix::fcntl::fcntl(old_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

    Ok(())
}

/// Check whether a process with the given pid still exists, by sending the
/// null signal to it.
pub fn process_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Get the size of one page of memory, in kilobytes.
pub fn page_size_kib() -> i64 {
    // 4 KiB pages are the kernel default on every architecture this sandbox
    // targets. Used as a fallback when `sysconf` fails.
    const DEFAULT_PAGE_SIZE_KIB: i64 = 4;

    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret == -1 {
        log::warn!("Failed to get page size through sysconf. Assume 4 KiB pages instead.");
        DEFAULT_PAGE_SIZE_KIB
    } else {
        ret / 1024
    }
}

#[cfg(test)]
mod tests {
    use super::{is_valid_c_string, split_words};

    #[test]
    fn test_is_valid_c_string() {
        assert!(is_valid_c_string("abc哈哈哈"));
        assert!(!is_valid_c_string("abc\x00哈哈哈"));
    }

    #[test]
    fn test_split_words() {
        let words = split_words("-l  1   ").collect::<Vec<&str>>();
        assert_eq!(vec!["-l", "1"], words);

        assert_eq!(0, split_words("").count());
        assert_eq!(0, split_words("   ").count());
    }
}
