//! Multiprocessor instruction cache synchronization.
//!
//! See [coordinator] for how synchronization is scheduled. A kernel normally builds a
//! [DomainRegistry] while bringing up secondary CPUs, hands it to [init] and then calls the free
//! functions in this module from its mapping layer, AST dispatcher, IPI handler and scheduler.
//!
//! All entry points take the kernel's [Platform] implementation for the executing CPU.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod coordinator;
pub mod domain;
pub mod mp;
pub mod pending;
pub mod platform;
pub mod stats;

pub use coordinator::Coordinator;
pub use domain::{DomainId, DomainRegistry, RegistryBuilder, RegistryError, TlbDomain};
pub use mp::{CpuIndex, CpuMask};
pub use pending::SlotGeometry;
pub use platform::{AstControl, AstReason, IcacheOps, IpiError, IpiReason, IpiTransport, Platform};
pub use stats::StatsSnapshot;

use conquer_once::spin::OnceCell;

static SYNCI: OnceCell<Coordinator> = OnceCell::uninit();

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InitError {
    /// [init] has already been called.
    AlreadyInitialized,
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InitError::AlreadyInitialized => write!(f, "synci is already initialized"),
        }
    }
}

/// Installs the system wide coordinator.
///
/// This should be called once all TLB domains are known and before any secondary CPU runs user
/// code. Until then [request_sync] synchronizes the calling CPU directly.
pub fn init(registry: DomainRegistry) -> Result<&'static Coordinator, InitError> {
    SYNCI
        .try_init_once(|| Coordinator::new(registry))
        .map_err(|_| InitError::AlreadyInitialized)?;
    SYNCI.get().ok_or(InitError::AlreadyInitialized)
}

/// Returns the system wide coordinator if [init] has been called.
pub fn coordinator() -> Option<&'static Coordinator> {
    SYNCI.get()
}

/// See [Coordinator::request_sync].
///
/// Before [init] only the boot CPU is running, so its whole instruction cache is synchronized
/// immediately.
pub fn request_sync<P: Platform + ?Sized>(platform: &P, page_index: u64, on_proc: CpuMask) {
    match coordinator() {
        Some(c) => c.request_sync(platform, page_index, on_proc),
        None => platform.sync_all(),
    }
}

/// See [Coordinator::drain_local].
pub fn drain_local<P: Platform + ?Sized>(platform: &P) {
    if let Some(c) = coordinator() {
        c.drain_local(platform)
    }
}

/// See [Coordinator::on_ipi_received].
pub fn on_ipi_received<P: Platform + ?Sized>(platform: &P) {
    if let Some(c) = coordinator() {
        c.on_ipi_received(platform)
    }
}

/// See [Coordinator::on_user_resume].
pub fn on_user_resume<P: Platform + ?Sized>(platform: &P) {
    if let Some(c) = coordinator() {
        c.on_user_resume(platform)
    }
}
