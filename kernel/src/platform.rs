//! Interfaces the coordinator requires from the rest of the kernel.
//!
//! Nothing in this crate knows how to flush an instruction cache, raise an interrupt on another
//! CPU or deliver an AST. Those are provided by the architecture and scheduler code through the
//! traits defined here. All of them are called on the CPU executing the coordinator entry point,
//! with preemption disabled.

use crate::mp::CpuIndex;

/// Instruction cache maintenance for the current CPU.
pub trait IcacheOps {
    /// Synchronizes the instruction cache lines indexed by `base..base + len`.
    ///
    /// `base` is an index address, not necessarily a mapped virtual address. Every page which
    /// aliases onto this index range must be synchronized by this call.
    fn sync_range(&self, base: usize, len: usize);

    /// Synchronizes the entire instruction cache.
    fn sync_all(&self);
}

/// Sends inter-processor interrupts.
pub trait IpiTransport {
    /// Raises an IPI on `target` for `reason`.
    ///
    /// This does not wait for the IPI to be handled.
    fn send_ipi(&self, target: CpuIndex, reason: IpiReason) -> Result<(), IpiError>;
}

/// Scheduler state for the current CPU.
pub trait AstControl {
    /// Returns the index of the executing CPU.
    fn current_cpu(&self) -> CpuIndex;

    /// Returns whether the executing CPU currently has a user address space loaded.
    fn user_context_active(&self) -> bool;

    /// Marks the thread running on the executing CPU as having a pending AST for `reason`.
    ///
    /// The scheduler must run the handler for `reason` before the thread next returns to user
    /// mode.
    fn set_ast_pending(&self, reason: AstReason);

    /// Returns the AST reasons currently pending on the executing CPU.
    fn ast_pending(&self) -> AstReason;
}

/// Everything the coordinator needs from the kernel.
pub trait Platform: IcacheOps + IpiTransport + AstControl {}

impl<T: IcacheOps + IpiTransport + AstControl> Platform for T {}

#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IpiReason {
    /// The receiver must re-check its TLB domain's pending page bitmap.
    Synci,
}

impl IpiReason {
    /// Interrupt vector used for this reason.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Synci => 0x22,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpiError {
    /// The target CPU does not exist or cannot be addressed.
    BadTarget(CpuIndex),
    /// The target CPU exists but has not been started.
    Offline(CpuIndex),
}

impl core::fmt::Display for IpiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IpiError::BadTarget(cpu) => write!(f, "CPU {cpu} cannot be targeted by an IPI"),
            IpiError::Offline(cpu) => write!(f, "CPU {cpu} is offline"),
        }
    }
}

bitflags::bitflags! {
    /// Reasons a thread may have an AST pending.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct AstReason: u32 {
        /// The instruction cache must be synchronized, the handler is [crate::Coordinator::drain_local].
        const SYNCI = 1 << 0;
    }
}
