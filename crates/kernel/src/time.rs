// Kernel timebase
//
// Time is counted in CLINT timer ticks. On the virt platform the timer
// runs at 10 MHz; sleep arguments arrive in nanoseconds and are converted
// here. Host builds substitute a manually advanced clock so the scheduler
// logic stays testable.

pub type Time = u64;

/// CLINT timer frequency on the virt platform.
pub const CLOCKS_PER_SEC: u64 = 10_000_000;

const NANOS_PER_CLOCK: u64 = 1_000_000_000 / CLOCKS_PER_SEC;

/// Convert a nanosecond duration into timer ticks, rounding down.
pub fn nanos_to_clocks(nanos: u64) -> Time {
    nanos / NANOS_PER_CLOCK
}

#[cfg(target_arch = "riscv64")]
pub fn get_time() -> Time {
    // CLINT mtime register on the virt platform
    const CLINT_MTIME: usize = 0x200_bff8;
    unsafe { core::ptr::read_volatile(CLINT_MTIME as *const u64) }
}

#[cfg(not(target_arch = "riscv64"))]
mod host_clock {
    use core::sync::atomic::{AtomicU64, Ordering};

    static CLOCK: AtomicU64 = AtomicU64::new(0);

    pub fn get_time() -> super::Time {
        CLOCK.load(Ordering::Relaxed)
    }

    pub fn advance_time(ticks: super::Time) {
        CLOCK.fetch_add(ticks, Ordering::Relaxed);
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub use host_clock::{advance_time, get_time};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanosecond_conversion() {
        assert_eq!(nanos_to_clocks(0), 0);
        assert_eq!(nanos_to_clocks(100), 1);
        assert_eq!(nanos_to_clocks(1_000_000_000), CLOCKS_PER_SEC);
        assert_eq!(nanos_to_clocks(99), 0);
    }
}
