/*
 * System Call Numbers
 *
 * The number arrives on the user stack at the trap, followed by up to
 * three word-sized arguments. Out-of-range numbers terminate the
 * calling process.
 */

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_MMAP: u32 = 13;
pub const SYS_MUNMAP: u32 = 14;

/// Exit status used for kernel-forced termination.
pub const STATUS_FAIL: i32 = -1;
