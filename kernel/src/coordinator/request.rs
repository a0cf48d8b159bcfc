use super::Coordinator;
use crate::domain::TlbDomain;
use crate::mp::{CpuIndex, CpuMask};
use crate::pending::Mark;
use crate::platform::{AstReason, IpiReason, Platform};
use crate::stats::Counters;

impl Coordinator {
    /// Requests that every CPU in `on_proc` synchronizes its instruction cache for `page_index`
    /// before it next returns to user mode.
    ///
    /// `on_proc` is the set of CPUs which may have the page mapped executable. It may contain
    /// more CPUs than actually need to sync but never fewer.
    ///
    /// This never blocks and never allocates, it may be called with interrupts disabled.
    /// The caller must have preemption disabled.
    pub fn request_sync<P: Platform + ?Sized>(&self, platform: &P, page_index: u64, on_proc: CpuMask) {
        let me = platform.current_cpu();
        if let Some(d) = self.local_domain(me) {
            Counters::bump(&d.counters().requests);
        }
        debug_assert!(
            on_proc.is_subset(&self.registry.all_cpus()),
            "on_proc {on_proc:?} names CPUs which are not registered"
        );

        let slot_mask = self.registry.geometry().slot_mask(page_index);
        for domain in self.registry.iter() {
            if domain.cpus().intersects(&on_proc) {
                self.request_domain(platform, me, domain, page_index, slot_mask, on_proc);
            }
        }
    }

    fn request_domain<P: Platform + ?Sized>(
        &self,
        platform: &P,
        me: CpuIndex,
        domain: &TlbDomain,
        page_index: u64,
        slot_mask: u64,
        on_proc: CpuMask,
    ) {
        let counters = domain.counters();
        let (mark, bits) = domain.pending().mark(slot_mask);

        if bits == self.registry.geometry().full_mask() && mark != Mark::Duplicate {
            log::trace!("synci: domain {} saturated", domain.id());
            Counters::bump(&counters.saturations);
        }

        match mark {
            Mark::Duplicate => {
                Counters::bump(&counters.duplicates);
                return;
            }
            Mark::Joined => {
                // whoever armed the bitmap will wake the domain
                Counters::bump(&counters.joined);
                return;
            }
            Mark::Armed => {}
        }

        log::trace!(
            "synci: CPU {me} armed domain {} for page {page_index:#x}",
            domain.id()
        );

        let mut wake = *domain.cpus() & on_proc;
        if wake.get(me) {
            wake.clear(me);
            if platform.user_context_active() {
                platform.set_ast_pending(AstReason::SYNCI);
                Counters::bump(&counters.local_wakes);
            } else {
                // the resume check will catch it on the way into user mode
                Counters::bump(&counters.deferred_wakes);
            }
        }

        for cpu in wake.iter() {
            match platform.send_ipi(cpu, IpiReason::Synci) {
                Ok(()) => Counters::bump(&counters.ipis_sent),
                Err(e) => {
                    log::error!("synci: failed to notify CPU {cpu}: {e}");
                    Counters::bump(&counters.ipi_failures);
                }
            }
        }
    }
}
