//! A model machine which records every call the coordinator makes into the platform.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use synci::{
    AstControl, AstReason, CpuIndex, CpuMask, IcacheOps, IpiError, IpiReason, IpiTransport,
    RegistryBuilder, SlotGeometry,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    SyncRange { cpu: CpuIndex, base: usize, len: usize },
    SyncAll { cpu: CpuIndex },
    Ipi { from: CpuIndex, to: CpuIndex },
    Ast { cpu: CpuIndex },
}

pub struct Machine {
    user: Vec<AtomicBool>,
    ast: Vec<AtomicU32>,
    offline: Mutex<BTreeSet<CpuIndex>>,
    events: Mutex<Vec<Event>>,
}

impl Machine {
    pub fn new(cpus: usize) -> Self {
        Self {
            user: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
            ast: (0..cpus).map(|_| AtomicU32::new(0)).collect(),
            offline: Mutex::new(BTreeSet::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn cpu(&self, cpu: CpuIndex) -> Cpu<'_> {
        Cpu { machine: self, cpu }
    }

    pub fn set_user(&self, cpu: CpuIndex, user: bool) {
        self.user[cpu as usize].store(user, Ordering::SeqCst);
    }

    pub fn set_offline(&self, cpu: CpuIndex) {
        self.offline.lock().unwrap().insert(cpu);
    }

    pub fn ast(&self, cpu: CpuIndex) -> AstReason {
        AstReason::from_bits_truncate(self.ast[cpu as usize].load(Ordering::SeqCst))
    }

    /// Clears the AST of `cpu` returning what was pending, like an AST dispatcher would.
    pub fn take_ast(&self, cpu: CpuIndex) -> AstReason {
        AstReason::from_bits_truncate(self.ast[cpu as usize].swap(0, Ordering::SeqCst))
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn ipis(&self) -> Vec<(CpuIndex, CpuIndex)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Ipi { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn syncs(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::SyncRange { .. } | Event::SyncAll { .. }))
            .collect()
    }

    fn record(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

pub struct Cpu<'a> {
    machine: &'a Machine,
    cpu: CpuIndex,
}

impl IcacheOps for Cpu<'_> {
    fn sync_range(&self, base: usize, len: usize) {
        self.machine.record(Event::SyncRange {
            cpu: self.cpu,
            base,
            len,
        });
    }

    fn sync_all(&self) {
        self.machine.record(Event::SyncAll { cpu: self.cpu });
    }
}

impl IpiTransport for Cpu<'_> {
    fn send_ipi(&self, target: CpuIndex, reason: IpiReason) -> Result<(), IpiError> {
        assert_eq!(reason, IpiReason::Synci);
        if target as usize >= self.machine.user.len() {
            return Err(IpiError::BadTarget(target));
        }
        if self.machine.offline.lock().unwrap().contains(&target) {
            return Err(IpiError::Offline(target));
        }
        self.machine.record(Event::Ipi {
            from: self.cpu,
            to: target,
        });
        Ok(())
    }
}

impl AstControl for Cpu<'_> {
    fn current_cpu(&self) -> CpuIndex {
        self.cpu
    }

    fn user_context_active(&self) -> bool {
        self.machine.user[self.cpu as usize].load(Ordering::SeqCst)
    }

    fn set_ast_pending(&self, reason: AstReason) {
        self.machine.ast[self.cpu as usize].fetch_or(reason.bits(), Ordering::SeqCst);
        self.machine.record(Event::Ast { cpu: self.cpu });
    }

    fn ast_pending(&self) -> AstReason {
        self.machine.ast(self.cpu)
    }
}

pub fn mask(cpus: &[CpuIndex]) -> CpuMask {
    cpus.iter().copied().collect()
}

/// Builds a registry with 4K pages and `slots` slots.
pub fn registry(slots: u32, domains: &[&[CpuIndex]]) -> synci::DomainRegistry {
    let mut b = RegistryBuilder::new(SlotGeometry::new(12, slots).unwrap());
    for d in domains {
        b = b.domain(mask(d));
    }
    b.build().unwrap()
}
