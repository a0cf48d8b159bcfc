//! The instruction cache synchronization coordinator.
//!
//! Instruction caches on the architectures this is used on are not coherent with data writes.
//! When the contents of an executable page change every CPU which may execute it must
//! synchronize its instruction cache before it next runs user code.
//!
//! Unlike a TLB shootdown nothing waits for the other CPUs here.
//! [Coordinator::request_sync] marks the page pending on every TLB domain which may have it
//! mapped and makes sure one CPU per domain has an AST pending. The CPU performs the
//! synchronization itself in [Coordinator::drain_local] on its way back to user mode.
//! Remote CPUs are notified with an IPI which only flags the AST, see
//! [Coordinator::on_ipi_received].
//!
//! Only the CPU which moves a domain's bitmap from clean to dirty sends notifications. Any
//! request which arrives while the bitmap is already dirty is picked up by the drain that
//! notification causes.

mod drain;
mod request;
mod wake;

use crate::domain::{DomainId, DomainRegistry, TlbDomain};
use crate::mp::CpuIndex;
use crate::stats::StatsSnapshot;

pub struct Coordinator {
    registry: DomainRegistry,
}

impl Coordinator {
    pub fn new(registry: DomainRegistry) -> Self {
        log::info!(
            "synci: {} TLB domain(s), {} slots of {:#x} bytes",
            registry.domain_count(),
            registry.geometry().slots(),
            registry.geometry().slot_len()
        );
        Self { registry }
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    /// Returns the counters of all domains added together.
    pub fn stats(&self) -> StatsSnapshot {
        self.registry
            .iter()
            .map(|d| d.counters().snapshot())
            .fold(StatsSnapshot::default(), |acc, s| acc + s)
    }

    /// Returns the counters of a single domain.
    ///
    /// # Panics
    ///
    /// This fn will panic if `id` is not a domain of this coordinator.
    pub fn domain_stats(&self, id: DomainId) -> StatsSnapshot {
        self.registry.domain(id).counters().snapshot()
    }

    /// Returns the domain the executing CPU belongs to.
    ///
    /// Every CPU which calls into the coordinator must have been registered, this is checked in
    /// debug builds. Release builds ignore the call instead.
    #[cfg_attr(debug_assertions, track_caller)]
    fn local_domain(&self, cpu: CpuIndex) -> Option<&TlbDomain> {
        let d = self.registry.domain_of(cpu);
        debug_assert!(d.is_some(), "CPU {cpu} is not a member of any TLB domain");
        if d.is_none() {
            log::error!("synci: CPU {cpu} is not a member of any TLB domain");
        }
        d
    }
}

impl core::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .finish()
    }
}
