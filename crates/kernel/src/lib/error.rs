// Kernel error handling and errno definitions

use core::fmt;

/// Error kinds shared between kernel-internal operations and the syscall
/// boundary. The numeric values are the classic errno numbers; syscalls
/// return them negated in `a0`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,      // Operation not permitted
    ENOENT = 2,     // No such file or directory
    ESRCH = 3,      // No such process
    EINTR = 4,      // Interrupted system call
    EIO = 5,        // I/O error
    ENXIO = 6,      // No such device or address
    E2BIG = 7,      // Argument list too long
    ENOEXEC = 8,    // Exec format error
    EBADF = 9,      // Bad file descriptor
    ECHILD = 10,    // No child processes
    EAGAIN = 11,    // Try again / would block
    ENOMEM = 12,    // Out of memory
    EACCES = 13,    // Permission denied
    EFAULT = 14,    // Bad address
    ENOTBLK = 15,   // Block device required
    EBUSY = 16,     // Device or resource busy
    EEXIST = 17,    // File exists
    EXDEV = 18,     // Cross-device link
    ENODEV = 19,    // No such device
    ENOTDIR = 20,   // Not a directory
    EISDIR = 21,    // Is a directory
    EINVAL = 22,    // Invalid argument
    ENFILE = 23,    // File table overflow
    EMFILE = 24,    // Too many open files
    ENOTTY = 25,    // Not a typewriter
    ETXTBSY = 26,   // Text file busy
    EFBIG = 27,     // File too large
    ENOSPC = 28,    // No space left on device
    ESPIPE = 29,    // Illegal seek
    EROFS = 30,     // Read-only file system
    EMLINK = 31,    // Too many links
    EPIPE = 32,     // Broken pipe
    EDOM = 33,      // Math argument out of domain
    ERANGE = 34,    // Math result not representable
    EUNSUP = 95,    // Operation not supported
}

impl Errno {
    /// Negated value for the syscall return convention. Errors occupy
    /// `[-4095, -1]`; everything else is a success payload.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::EIO => "I/O error",
            Errno::ENXIO => "No such device or address",
            Errno::E2BIG => "Argument list too long",
            Errno::ENOEXEC => "Exec format error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::ENOTBLK => "Block device required",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::EXDEV => "Cross-device link",
            Errno::ENODEV => "No such device",
            Errno::ENOTDIR => "Not a directory",
            Errno::EISDIR => "Is a directory",
            Errno::EINVAL => "Invalid argument",
            Errno::ENFILE => "File table overflow",
            Errno::EMFILE => "Too many open files",
            Errno::ENOTTY => "Not a typewriter",
            Errno::ETXTBSY => "Text file busy",
            Errno::EFBIG => "File too large",
            Errno::ENOSPC => "No space left on device",
            Errno::ESPIPE => "Illegal seek",
            Errno::EROFS => "Read-only file system",
            Errno::EMLINK => "Too many links",
            Errno::EPIPE => "Broken pipe",
            Errno::EDOM => "Math argument out of domain of func",
            Errno::ERANGE => "Math result not representable",
            Errno::EUNSUP => "Operation not supported",
        }
    }
}

/// Error value carried by every fallible kernel-internal operation.
/// `details` optionally narrows down the failure site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub kind: Errno,
    pub details: Option<&'static str>,
}

impl Error {
    pub const fn new(kind: Errno) -> Self {
        Self { kind, details: None }
    }

    pub const fn with_details(kind: Errno, details: &'static str) -> Self {
        Self { kind, details: Some(details) }
    }

    /// The detail message if present, otherwise the kind's message.
    pub fn message(&self) -> &'static str {
        match self.details {
            Some(details) => details,
            None => self.kind.description(),
        }
    }

    pub fn as_isize(&self) -> isize {
        self.kind.as_isize()
    }
}

impl From<Errno> for Error {
    fn from(kind: Errno) -> Self {
        Error::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_return_convention() {
        assert_eq!(Errno::EPERM.as_isize(), -1);
        assert_eq!(Errno::ENOMEM.as_isize(), -12);
        assert_eq!(Errno::EUNSUP.as_isize(), -95);
        assert!((-4095..=-1).contains(&Errno::EUNSUP.as_isize()));
    }

    #[test]
    fn details_override_kind_message() {
        let plain = Error::new(Errno::EIO);
        assert_eq!(plain.message(), "I/O error");
        let detailed = Error::with_details(Errno::EIO, "virtio ring corrupt");
        assert_eq!(detailed.message(), "virtio ring corrupt");
        assert_eq!(detailed.kind, Errno::EIO);
    }
}
