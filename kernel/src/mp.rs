//! Processor identifiers and fixed-size processor sets.

mod bitmap;

pub use bitmap::{CpuMask, CpuMaskIter};

pub type CpuCount = core::num::NonZeroU32;
pub type CpuIndex = u32;

/// The number of CPUs a [CpuMask] is able to describe.
///
/// CPU indices are expected to be dense and start at `0`.
pub const MAX_CPUS: usize = 256;
