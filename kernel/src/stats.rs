//! Event counters.
//!
//! Counters are only ever incremented with relaxed ordering, they do not synchronize anything
//! and a snapshot taken while other CPUs are active is not guaranteed to be consistent.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters for a single TLB domain.
        #[derive(Debug, Default)]
        pub struct Counters {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        impl Counters {
            pub const fn new() -> Self {
                Self {
                    $($name: AtomicU64::new(0),)*
                }
            }

            /// Copies the current counter values.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        /// A copy of [Counters] at a single point in time.
        #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl core::ops::Add for StatsSnapshot {
            type Output = Self;

            fn add(self, rhs: Self) -> Self::Output {
                Self {
                    $($name: self.$name + rhs.$name,)*
                }
            }
        }

        impl core::fmt::Display for StatsSnapshot {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                $(writeln!(f, "{:>16}: {}", stringify!($name), self.$name)?;)*
                Ok(())
            }
        }
    };
}

counters! {
    /// Calls to `request_sync` made by CPUs of this domain.
    requests,
    /// Requests for a slot which was already pending.
    duplicates,
    /// Requests which set a slot while other slots were pending.
    joined,
    /// Requests which left every slot pending.
    saturations,
    /// Drains which synchronized the whole instruction cache.
    full_syncs,
    /// Slots synchronized individually.
    pages_synced,
    /// Drains which found at least one pending slot.
    drains,
    /// IPIs sent to CPUs of this domain.
    ipis_sent,
    /// IPIs which the transport refused.
    ipi_failures,
    /// CPUs flagged from the IPI handler while running user code.
    ast_wakes,
    /// Requesting CPUs which flagged themselves.
    local_wakes,
    /// Wakes skipped because no user address space was loaded.
    deferred_wakes,
    /// CPUs flagged when switching into a user address space.
    resume_wakes,
}

impl Counters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        Self::add(counter, 1)
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_sum() {
        let a = Counters::new();
        Counters::bump(&a.requests);
        Counters::add(&a.pages_synced, 3);
        let b = Counters::new();
        Counters::bump(&b.requests);
        Counters::bump(&b.full_syncs);

        let sum = a.snapshot() + b.snapshot();
        assert_eq!(sum.requests, 2);
        assert_eq!(sum.pages_synced, 3);
        assert_eq!(sum.full_syncs, 1);
        assert_eq!(sum.ipis_sent, 0);
    }
}
