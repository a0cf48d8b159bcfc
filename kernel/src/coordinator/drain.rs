use super::Coordinator;
use crate::pending::SlotIter;
use crate::platform::Platform;
use crate::stats::Counters;

impl Coordinator {
    /// Synchronizes the instruction cache of the executing CPU for every slot pending on its
    /// TLB domain.
    ///
    /// This is the AST handler for [crate::AstReason::SYNCI] and must be called before the CPU
    /// returns to user mode whenever that AST is pending. The caller must have preemption
    /// disabled and must not hold any lock the cache primitives may need.
    ///
    /// Slots which become pending while this runs are not synchronized by this call, they will
    /// raise a new AST.
    pub fn drain_local<P: Platform + ?Sized>(&self, platform: &P) {
        let me = platform.current_cpu();
        let Some(domain) = self.local_domain(me) else {
            return;
        };
        let counters = domain.counters();
        let geometry = self.registry.geometry();

        let pending = domain.pending().take();
        if pending == 0 {
            return;
        }
        Counters::bump(&counters.drains);

        if pending == geometry.full_mask() {
            platform.sync_all();
            Counters::bump(&counters.full_syncs);
            let generation = domain.complete_full_sync(me);
            log::debug!(
                "synci: CPU {me} synced all of domain {} (generation {generation})",
                domain.id()
            );
            return;
        }

        let mut n = 0;
        for slot in SlotIter(pending) {
            platform.sync_range(geometry.slot_base(slot), geometry.slot_len());
            n += 1;
        }
        Counters::add(&counters.pages_synced, n);
        log::debug!(
            "synci: CPU {me} synced {n} slot(s) of domain {} ({pending:#x})",
            domain.id()
        );
    }
}
