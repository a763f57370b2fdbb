//! Address lifetimes: absolute timestamps in the address model, relative
//! seconds on the wire.

use nix::time::{ClockId, clock_gettime};
use std::fmt;
use tracing::warn;

/// Wire value for an infinite valid/preferred lifetime.
pub const INFINITE_LIFETIME: u32 = 0xffff_ffff;

/// Absolute point in time at which an address is deprecated or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Never deprecated / never expires.
    Permanent,
    /// Unknown to the producer; treated like `Permanent` on the wire.
    Unknown,
    /// Milliseconds on the injected clock's timeline.
    At(i64),
}

impl Lifetime {
    pub fn is_finite(&self) -> bool {
        matches!(self, Lifetime::At(_))
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifetime::Permanent => write!(f, "permanent"),
            Lifetime::Unknown => write!(f, "unknown"),
            Lifetime::At(ms) => write!(f, "{ms}ms"),
        }
    }
}

/// Convert an absolute lifetime into remaining seconds relative to `now_ms`.
///
/// Never negative; saturates at [`INFINITE_LIFETIME`].
pub fn to_relative_lifetime(lifetime: Lifetime, now_ms: i64) -> u32 {
    match lifetime {
        Lifetime::Permanent | Lifetime::Unknown => INFINITE_LIFETIME,
        Lifetime::At(at_ms) => {
            let seconds = at_ms.saturating_sub(now_ms) / 1000;
            seconds.clamp(0, i64::from(INFINITE_LIFETIME)) as u32
        }
    }
}

/// Source of "now" for lifetime computations.
pub trait Clock: Send {
    fn now_ms(&self) -> i64;
}

/// Milliseconds since boot, including time spent suspended.
#[derive(Debug, Default, Clone, Copy)]
pub struct BootClock;

impl Clock for BootClock {
    fn now_ms(&self) -> i64 {
        read_clock(ClockId::CLOCK_BOOTTIME)
            .or_else(|_| read_clock(ClockId::CLOCK_MONOTONIC))
            .unwrap_or_else(|e| {
                warn!(error = %e, "No usable clock, lifetimes are relative to boot");
                0
            })
    }
}

fn read_clock(clock: ClockId) -> nix::Result<i64> {
    clock_gettime(clock)
        .map(|ts| i64::from(ts.tv_sec()) * 1000 + i64::from(ts.tv_nsec()) / 1_000_000)
}
