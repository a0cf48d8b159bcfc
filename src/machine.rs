//! A simulated multiprocessor.
//!
//! Each TLB domain shares one instruction cache, modelled as the set of page indices whose
//! cached instructions no longer match memory. Writing a page adds it to the set of every domain
//! in `on_proc`, synchronizing a slot removes every page aliasing onto it.
//!
//! IPIs are queued in a per-CPU mailbox and are only handled when the CPU is told to take its
//! interrupts, so a test can interleave delivery with everything else.
//!
//! Once the request for a write has returned the stale page is stamped from a machine wide
//! clock. A CPU which synchronizes, either because an IPI raised its AST in user mode or on its
//! way back to user mode, must not see any page stamped before that point afterwards. Every such
//! page is counted as a violation.

use crate::config::Config;
use crate::SimError;
use crossbeam_queue::ArrayQueue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use synci::{
    AstControl, AstReason, Coordinator, CpuIndex, CpuMask, IcacheOps, IpiError, IpiReason,
    IpiTransport, SlotGeometry,
};

/// Outstanding IPIs a CPU can hold. Further IPIs for the same reason are coalesced.
const MAILBOX_SIZE: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CpuMode {
    /// Running kernel code without a user address space.
    Kernel,
    /// Running user code.
    User,
    /// Not a member of any TLB domain.
    Offline,
}

struct SimCpu {
    mode: atomic::Atomic<CpuMode>,
    ast: AtomicU32,
    mailbox: ArrayQueue<IpiReason>,
    domain: Option<usize>,
}

impl SimCpu {
    fn new(domain: Option<usize>) -> Self {
        Self {
            mode: atomic::Atomic::new(if domain.is_some() {
                CpuMode::Kernel
            } else {
                CpuMode::Offline
            }),
            ast: AtomicU32::new(0),
            mailbox: ArrayQueue::new(MAILBOX_SIZE),
            domain,
        }
    }
}

pub struct Machine {
    coordinator: Coordinator,
    geometry: SlotGeometry,
    cpus: Box<[SimCpu]>,
    /// Stale pages of each domain and the clock value at which their request returned.
    stale: Box<[spin::Mutex<BTreeMap<u64, Option<u64>>>]>,
    /// Held for reading while a CPU drains its domain.
    drains: Box<[spin::RwLock<()>]>,
    clock: AtomicU64,
    violations: AtomicU64,
}

impl Machine {
    /// Builds a machine with one CPU for every index up to the highest registered one.
    ///
    /// All CPUs start in kernel mode, CPUs which are not members of a domain are offline.
    pub fn new(coordinator: Coordinator) -> Self {
        let registry = coordinator.registry();
        let count = registry
            .all_cpus()
            .iter()
            .last()
            .map_or(0, |c| c as usize + 1);
        let cpus = (0..count as CpuIndex)
            .map(|c| SimCpu::new(registry.domain_of(c).map(|d| d.id() as usize)))
            .collect();
        let stale = registry
            .iter()
            .map(|_| spin::Mutex::new(BTreeMap::new()))
            .collect();
        let drains = registry.iter().map(|_| spin::RwLock::new(())).collect();

        Self {
            geometry: *registry.geometry(),
            coordinator,
            cpus,
            stale,
            drains,
            clock: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Builds the machine described by `cfg` and moves the CPUs it lists as user CPUs into user
    /// mode.
    pub fn from_config(cfg: &Config) -> Result<Self, SimError> {
        let m = Self::new(Coordinator::new(cfg.registry()?));
        for cpu in cfg.domains.iter().flat_map(|d| d.user.iter()) {
            m.enter_user(*cpu)?;
        }
        Ok(m)
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn online_cpus(&self) -> Vec<CpuIndex> {
        (0..self.cpus.len() as CpuIndex)
            .filter(|c| self.cpus[*c as usize].domain.is_some())
            .collect()
    }

    /// Number of times a CPU executed or kept a stale page the coordinator should have
    /// synchronized.
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Returns whether any domain still caches a stale page or has slots pending.
    pub fn is_consistent(&self) -> bool {
        self.stale.iter().all(|s| s.lock().is_empty())
            && self.coordinator.registry().iter().all(|d| d.pending().is_clean())
    }

    fn sim_cpu(&self, cpu: CpuIndex) -> Result<&SimCpu, SimError> {
        self.cpus.get(cpu as usize).ok_or(SimError::BadCpu(cpu))
    }

    pub fn mode(&self, cpu: CpuIndex) -> Result<CpuMode, SimError> {
        Ok(self.sim_cpu(cpu)?.mode.load(Ordering::Acquire))
    }

    fn handle(&self, cpu: CpuIndex) -> Result<CpuHandle<'_>, SimError> {
        let sim = self.sim_cpu(cpu)?;
        let domain = sim.domain.ok_or(SimError::BadCpu(cpu))?;
        Ok(CpuHandle {
            machine: self,
            cpu,
            sim,
            domain,
        })
    }

    /// Writes new instructions to `page` on `cpu`, which may be cached by every CPU in
    /// `on_proc`.
    pub fn write_page(&self, cpu: CpuIndex, page: u64, on_proc: &[CpuIndex]) -> Result<(), SimError> {
        let h = self.handle(cpu)?;
        let mut mask = CpuMask::new();
        let mut domains = BTreeSet::new();
        for target in on_proc {
            domains.insert(self.handle(*target)?.domain);
            mask.set(*target);
        }

        for d in &domains {
            // an older write which is still stale keeps its stamp
            self.stale[*d].lock().entry(page).or_insert(None);
        }
        self.coordinator.request_sync(&h, page, mask);
        for d in &domains {
            let mut stale = self.stale[*d].lock();
            if let Some(done) = stale.get_mut(&page).filter(|d| d.is_none()) {
                *done = Some(self.clock.fetch_add(1, Ordering::SeqCst));
            }
        }
        Ok(())
    }

    /// Handles every IPI queued for `cpu`.
    pub fn deliver(&self, cpu: CpuIndex) -> Result<(), SimError> {
        let h = self.handle(cpu)?;
        self.deliver_to(&h);
        Ok(())
    }

    /// Returns whether a synci IPI was handled.
    fn deliver_to(&self, h: &CpuHandle<'_>) -> bool {
        let mut synci = false;
        while let Some(reason) = h.sim.mailbox.pop() {
            match reason {
                IpiReason::Synci => {
                    self.coordinator.on_ipi_received(h);
                    synci = true;
                }
                _ => log::warn!("CPU {} received unexpected IPI {reason:?}", h.cpu),
            }
        }
        synci
    }

    /// Takes the interrupts of `cpu` and, when it is running user code, the ASTs they raised.
    ///
    /// Unlike [Self::return_to_user] this never runs the resume check, a CPU which stays in user
    /// mode only synchronizes because it was woken.
    pub fn take_interrupts(&self, cpu: CpuIndex) -> Result<(), SimError> {
        let h = self.handle(cpu)?;
        let since = self.clock.fetch_add(1, Ordering::SeqCst);
        let woken = self.deliver_to(&h);
        if h.sim.mode.load(Ordering::Acquire) == CpuMode::User {
            self.run_asts(&h);
            if woken {
                self.audit(&h, since);
            }
        }
        Ok(())
    }

    fn run_asts(&self, h: &CpuHandle<'_>) {
        let ast = AstReason::from_bits_truncate(h.sim.ast.swap(0, Ordering::AcqRel));
        if ast.contains(AstReason::SYNCI) {
            let _draining = self.drains[h.domain].read();
            self.coordinator.drain_local(h);
        }
    }

    /// Counts the pages of the domain of `h` which were published before `since` and are still
    /// stale.
    fn audit(&self, h: &CpuHandle<'_>, since: u64) -> u64 {
        // drains which took slots before ours may still be running
        let _quiet = self.drains[h.domain].write();
        let stale = self.stale[h.domain].lock();
        let mut missed = 0;
        for (page, done) in stale.iter() {
            if matches!(done, Some(t) if *t < since) {
                log::warn!("CPU {} synchronized but page {page:#x} is still stale", h.cpu);
                missed += 1;
            }
        }
        self.violations.fetch_add(missed, Ordering::Relaxed);
        missed
    }

    /// Counts domains where every CPU runs user code and none of them will synchronize,
    /// although slots are pending or pages are stale. Every such domain is a violation.
    ///
    /// Only meaningful while no other thread drives the machine.
    pub fn check_idle(&self) -> u64 {
        let mut unwoken = 0;
        for d in self.coordinator.registry().iter() {
            let idx = d.id() as usize;
            let cpus = || d.cpus().iter().map(|c| &self.cpus[c as usize]);
            let all_user = cpus().all(|c| c.mode.load(Ordering::Acquire) == CpuMode::User);
            let scheduled = cpus().any(|c| {
                AstReason::from_bits_truncate(c.ast.load(Ordering::Acquire))
                    .contains(AstReason::SYNCI)
                    || !c.mailbox.is_empty()
            });
            let dirty = !d.pending().is_clean() || !self.stale[idx].lock().is_empty();
            if all_user && !scheduled && dirty {
                log::warn!("domain {idx} runs user code with stale instructions and no wake");
                unwoken += 1;
            }
        }
        self.violations.fetch_add(unwoken, Ordering::Relaxed);
        unwoken
    }

    pub fn enter_kernel(&self, cpu: CpuIndex) -> Result<(), SimError> {
        let h = self.handle(cpu)?;
        h.sim.mode.store(CpuMode::Kernel, Ordering::Release);
        Ok(())
    }

    /// Runs the return to user path of `cpu` without taking its interrupts.
    pub fn enter_user(&self, cpu: CpuIndex) -> Result<(), SimError> {
        let h = self.handle(cpu)?;
        let since = self.clock.fetch_add(1, Ordering::SeqCst);
        self.coordinator.on_user_resume(&h);
        self.run_asts(&h);
        h.sim.mode.store(CpuMode::User, Ordering::Release);
        self.audit(&h, since);
        Ok(())
    }

    pub fn return_to_user(&self, cpu: CpuIndex) -> Result<(), SimError> {
        self.deliver(cpu)?;
        self.enter_user(cpu)
    }

    /// Executes `page` on `cpu`. Returns `false` and records a violation when a user mode CPU
    /// executes stale instructions.
    pub fn execute(&self, cpu: CpuIndex, page: u64) -> Result<bool, SimError> {
        let h = self.handle(cpu)?;
        if h.sim.mode.load(Ordering::Acquire) != CpuMode::User {
            return Ok(true);
        }
        if self.stale[h.domain].lock().contains_key(&page) {
            log::warn!("CPU {cpu} executed stale page {page:#x}");
            self.violations.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        Ok(true)
    }
}

/// The view of the machine from one of its CPUs.
struct CpuHandle<'a> {
    machine: &'a Machine,
    cpu: CpuIndex,
    sim: &'a SimCpu,
    domain: usize,
}

impl IcacheOps for CpuHandle<'_> {
    fn sync_range(&self, base: usize, len: usize) {
        let g = self.machine.geometry;
        let first = (base >> g.page_shift()) as u32;
        let last = ((base + len - 1) >> g.page_shift()) as u32;
        self.machine.stale[self.domain]
            .lock()
            .retain(|page, _| !(first..=last).contains(&g.slot_of(*page)));
    }

    fn sync_all(&self) {
        self.machine.stale[self.domain].lock().clear();
    }
}

impl IpiTransport for CpuHandle<'_> {
    fn send_ipi(&self, target: CpuIndex, reason: IpiReason) -> Result<(), IpiError> {
        let cpu = self
            .machine
            .cpus
            .get(target as usize)
            .ok_or(IpiError::BadTarget(target))?;
        if cpu.mode.load(Ordering::Acquire) == CpuMode::Offline {
            return Err(IpiError::Offline(target));
        }
        // a full mailbox already holds an IPI which will make the target re-check
        if cpu.mailbox.push(reason).is_err() {
            log::trace!("CPU {target} mailbox full, IPI coalesced");
        }
        Ok(())
    }
}

impl AstControl for CpuHandle<'_> {
    fn current_cpu(&self) -> CpuIndex {
        self.cpu
    }

    fn user_context_active(&self) -> bool {
        self.sim.mode.load(Ordering::Acquire) == CpuMode::User
    }

    fn set_ast_pending(&self, reason: AstReason) {
        self.sim.ast.fetch_or(reason.bits(), Ordering::AcqRel);
    }

    fn ast_pending(&self) -> AstReason {
        AstReason::from_bits_truncate(self.sim.ast.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synci::RegistryBuilder;

    fn machine(slots: u32, domains: &[&[CpuIndex]]) -> Machine {
        let mut b = RegistryBuilder::new(SlotGeometry::new(12, slots).unwrap());
        for d in domains {
            b = b.domain(d.iter().copied().collect());
        }
        Machine::new(Coordinator::new(b.build().unwrap()))
    }

    #[test]
    fn user_cpu_is_woken_by_remote_write() {
        let m = machine(32, &[&[0], &[1]]);
        m.enter_user(1).unwrap();
        m.write_page(0, 40, &[1]).unwrap();

        // the interrupt returns through the AST check
        m.deliver(1).unwrap();
        m.enter_user(1).unwrap();
        assert!(m.execute(1, 40).unwrap());
        assert!(m.is_consistent());

        let s = m.coordinator().stats();
        assert_eq!(s.ipis_sent, 1);
        assert_eq!(s.ast_wakes, 1);
        assert_eq!(s.resume_wakes, 0);
        assert_eq!(m.violations(), 0);
    }

    #[test]
    fn stale_execution_is_recorded() {
        let m = machine(32, &[&[0], &[1]]);
        m.enter_user(1).unwrap();
        m.write_page(0, 40, &[1]).unwrap();
        assert!(!m.execute(1, 40).unwrap());
        assert!(m.execute(0, 40).unwrap());
        assert_eq!(m.violations(), 1);
    }

    #[test]
    fn kernel_cpu_catches_up_on_resume() {
        let m = machine(32, &[&[0], &[1]]);
        m.write_page(0, 7, &[1]).unwrap();
        m.deliver(1).unwrap();
        m.enter_user(1).unwrap();
        assert!(m.execute(1, 7).unwrap());

        let s = m.coordinator().stats();
        assert_eq!(s.deferred_wakes, 1);
        assert_eq!(s.resume_wakes, 1);
        assert_eq!(m.violations(), 0);
    }

    #[test]
    fn offline_cpus() {
        let m = machine(32, &[&[0], &[2]]);
        assert_eq!(m.cpu_count(), 3);
        assert_eq!(m.online_cpus(), [0, 2]);
        assert_eq!(m.cpus[1].mode.load(Ordering::Relaxed), CpuMode::Offline);
        assert!(matches!(m.enter_user(1), Err(SimError::BadCpu(1))));
        assert!(matches!(m.deliver(9), Err(SimError::BadCpu(9))));
    }

    #[test]
    fn write_to_offline_cpu_changes_nothing() {
        let m = machine(32, &[&[0], &[2]]);
        assert!(matches!(m.write_page(0, 5, &[0, 1]), Err(SimError::BadCpu(1))));
        assert!(m.is_consistent());
        assert_eq!(m.coordinator().stats().requests, 0);
    }

    #[test]
    fn user_cpu_syncs_on_interrupt_alone() {
        let m = machine(32, &[&[0], &[1, 2]]);
        m.enter_user(1).unwrap();
        m.enter_user(2).unwrap();
        m.write_page(0, 40, &[1, 2]).unwrap();

        m.take_interrupts(2).unwrap();
        assert!(m.execute(1, 40).unwrap());
        assert!(m.execute(2, 40).unwrap());
        // the IPI to CPU 1 only finds its AST to run
        m.take_interrupts(1).unwrap();
        assert!(m.is_consistent());

        let s = m.coordinator().stats();
        assert_eq!(s.ast_wakes, 2);
        assert_eq!(s.resume_wakes, 0);
        assert_eq!(s.drains, 1);
        assert_eq!(m.violations(), 0);
    }

    #[test]
    fn kernel_cpu_ignores_ast_until_resume() {
        let m = machine(32, &[&[0], &[1]]);
        m.write_page(0, 9, &[1]).unwrap();
        m.take_interrupts(1).unwrap();
        assert!(!m.coordinator().registry().domain(1).pending().is_clean());
        m.enter_user(1).unwrap();
        assert!(m.is_consistent());
        assert_eq!(m.coordinator().stats().deferred_wakes, 1);
        assert_eq!(m.violations(), 0);
    }

    #[test]
    fn unwoken_user_domain_is_reported() {
        let m = machine(32, &[&[0, 1], &[2]]);
        for cpu in 0..3 {
            m.enter_user(cpu).unwrap();
        }
        assert_eq!(m.check_idle(), 0);

        // slots marked behind the coordinator's back never wake anyone
        let d = m.coordinator().registry().domain(0);
        d.pending().mark(1 << 4);
        assert_eq!(m.check_idle(), 1);

        // a kernel mode CPU will catch up when it resumes
        m.enter_kernel(1).unwrap();
        assert_eq!(m.check_idle(), 0);
        m.enter_user(1).unwrap();
        assert!(m.is_consistent());
        assert_eq!(m.violations(), 1);
    }

    #[test]
    fn resume_audit_counts_pages_left_behind() {
        let m = machine(32, &[&[0], &[1]]);
        m.enter_user(1).unwrap();
        // stale without a request, nothing will ever synchronize it
        m.stale[1].lock().insert(3, Some(0));
        m.enter_kernel(1).unwrap();
        m.enter_user(1).unwrap();
        assert_eq!(m.violations(), 1);
    }

    #[test]
    fn mailbox_coalesces() {
        let m = machine(32, &[&[0], &[1]]);
        for page in 0..8 {
            m.write_page(0, page, &[1]).unwrap();
            // never takes the interrupt, the resume check drains instead
            m.enter_kernel(1).unwrap();
            m.enter_user(1).unwrap();
        }
        m.return_to_user(1).unwrap();
        assert!(m.is_consistent());

        let s = m.coordinator().stats();
        assert_eq!(s.ipis_sent, 8);
        assert_eq!(s.ipi_failures, 0);
        assert_eq!(s.resume_wakes, 8);
        assert_eq!(s.ast_wakes, MAILBOX_SIZE as u64);
        assert_eq!(s.drains, 8);
    }
}
