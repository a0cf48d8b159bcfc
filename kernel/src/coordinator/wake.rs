use super::Coordinator;
use crate::platform::{AstReason, Platform};
use crate::stats::Counters;

impl Coordinator {
    /// IPI handler for [crate::IpiReason::Synci].
    ///
    /// This runs in interrupt context. It never synchronizes the cache and never touches the
    /// pending bitmap, it only flags the AST when user code is running on this CPU. When no user
    /// address space is loaded this CPU cannot execute stale user instructions, and
    /// [Self::on_user_resume] will flag the AST before one is loaded.
    pub fn on_ipi_received<P: Platform + ?Sized>(&self, platform: &P) {
        let me = platform.current_cpu();
        let Some(domain) = self.local_domain(me) else {
            return;
        };

        if platform.user_context_active() {
            platform.set_ast_pending(AstReason::SYNCI);
            Counters::bump(&domain.counters().ast_wakes);
        } else {
            Counters::bump(&domain.counters().deferred_wakes);
        }
    }

    /// Checks for pending slots when a CPU is about to enter user mode.
    ///
    /// The scheduler must call this each time it returns the executing CPU to user mode, before
    /// ASTs are dispatched. If slots are pending on this CPU's domain and no synchronization is
    /// already scheduled the AST is flagged here.
    pub fn on_user_resume<P: Platform + ?Sized>(&self, platform: &P) {
        let me = platform.current_cpu();
        let Some(domain) = self.local_domain(me) else {
            return;
        };

        if !domain.pending().is_clean() && !platform.ast_pending().contains(AstReason::SYNCI) {
            log::trace!("synci: CPU {me} resuming with pending slots");
            platform.set_ast_pending(AstReason::SYNCI);
            Counters::bump(&domain.counters().resume_wakes);
        }
    }
}
