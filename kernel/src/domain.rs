//! TLB domains and the boot-time registry describing them.
//!
//! A TLB domain is a group of CPUs sharing a single TLB context, and with it the instruction
//! cache state tracked by this crate. The registry is built once while the system is brought up
//! and never changes afterwards, so lookups take no locks.

use crate::mp::{CpuIndex, CpuMask, MAX_CPUS};
use crate::pending::{PendingBitmap, SlotGeometry};
use crate::stats::Counters;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Index of a domain within its [DomainRegistry].
pub type DomainId = u16;

const NO_DOMAIN: DomainId = DomainId::MAX;

pub struct TlbDomain {
    id: DomainId,
    cpus: CpuMask,
    pending: PendingBitmap,
    local: spin::Mutex<DomainLocal>,
    counters: Counters,
}

/// Domain fields which are protected by the domain lock.
#[derive(Debug, Default)]
struct DomainLocal {
    generation: u64,
    last_full_sync: Option<CpuIndex>,
}

impl TlbDomain {
    fn new(id: DomainId, cpus: CpuMask) -> Self {
        Self {
            id,
            cpus,
            pending: PendingBitmap::new(),
            local: spin::Mutex::new(DomainLocal::default()),
            counters: Counters::new(),
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Returns the CPUs which are members of this domain.
    pub fn cpus(&self) -> &CpuMask {
        &self.cpus
    }

    pub fn pending(&self) -> &PendingBitmap {
        &self.pending
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Returns the number of times the whole instruction cache of this domain has been
    /// synchronized.
    pub fn generation(&self) -> u64 {
        self.local.lock().generation
    }

    /// Returns the CPU which most recently synchronized the whole instruction cache.
    pub fn last_full_sync(&self) -> Option<CpuIndex> {
        self.local.lock().last_full_sync
    }

    /// Records that `cpu` has synchronized the entire cache. Returns the new generation.
    pub(crate) fn complete_full_sync(&self, cpu: CpuIndex) -> u64 {
        let mut l = self.local.lock();
        l.generation += 1;
        l.last_full_sync = Some(cpu);
        l.generation
    }
}

impl core::fmt::Debug for TlbDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlbDomain")
            .field("id", &self.id)
            .field("cpus", &self.cpus)
            .field("pending", &format_args!("{:#x}", self.pending.load()))
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// No domains were given.
    NoDomains,
    /// The domain contains no CPUs.
    EmptyDomain(DomainId),
    /// `cpu` was given to more than one domain.
    Overlap {
        cpu: CpuIndex,
        first: DomainId,
        second: DomainId,
    },
    /// More domains were given than can be identified by a [DomainId].
    TooManyDomains,
}

impl core::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RegistryError::NoDomains => write!(f, "no TLB domains were registered"),
            RegistryError::EmptyDomain(id) => write!(f, "TLB domain {id} has no CPUs"),
            RegistryError::Overlap { cpu, first, second } => write!(
                f,
                "CPU {cpu} belongs to both TLB domain {first} and TLB domain {second}"
            ),
            RegistryError::TooManyDomains => write!(f, "too many TLB domains"),
        }
    }
}

/// Collects the TLB domains of the system.
///
/// ```
/// use synci::{CpuMask, RegistryBuilder, SlotGeometry};
///
/// let registry = RegistryBuilder::new(SlotGeometry::new(12, 32).unwrap())
///     .domain([0, 1].into_iter().collect::<CpuMask>())
///     .domain(CpuMask::from_cpu(2))
///     .build()
///     .unwrap();
/// assert_eq!(registry.domain_count(), 2);
/// assert_eq!(registry.domain_of(2).unwrap().id(), 1);
/// ```
pub struct RegistryBuilder {
    geometry: SlotGeometry,
    domains: Vec<CpuMask>,
}

impl RegistryBuilder {
    pub fn new(geometry: SlotGeometry) -> Self {
        Self {
            geometry,
            domains: Vec::new(),
        }
    }

    /// Adds a domain containing `cpus`. Domains are numbered in the order they are added.
    pub fn domain(mut self, cpus: CpuMask) -> Self {
        self.domains.push(cpus);
        self
    }

    pub fn build(self) -> Result<DomainRegistry, RegistryError> {
        if self.domains.is_empty() {
            return Err(RegistryError::NoDomains);
        }
        if self.domains.len() >= NO_DOMAIN as usize {
            return Err(RegistryError::TooManyDomains);
        }

        let mut cpu_domain = Box::new([NO_DOMAIN; MAX_CPUS]);
        let mut all = CpuMask::new();
        let mut domains = Vec::with_capacity(self.domains.len());

        for (id, cpus) in self.domains.into_iter().enumerate() {
            let id = id as DomainId;
            if cpus.is_empty() {
                return Err(RegistryError::EmptyDomain(id));
            }
            for cpu in cpus.iter() {
                let slot = &mut cpu_domain[cpu as usize];
                if *slot != NO_DOMAIN {
                    return Err(RegistryError::Overlap {
                        cpu,
                        first: *slot,
                        second: id,
                    });
                }
                *slot = id;
            }
            all |= cpus;
            domains.push(TlbDomain::new(id, cpus));
        }

        Ok(DomainRegistry {
            geometry: self.geometry,
            domains: domains.into_boxed_slice(),
            cpu_domain,
            all,
        })
    }
}

/// The TLB domains of the system.
pub struct DomainRegistry {
    geometry: SlotGeometry,
    domains: Box<[TlbDomain]>,
    cpu_domain: Box<[DomainId; MAX_CPUS]>,
    all: CpuMask,
}

impl DomainRegistry {
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// Returns the domain identified by `id`.
    ///
    /// # Panics
    ///
    /// This fn will panic if `id` was not returned by this registry.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn domain(&self, id: DomainId) -> &TlbDomain {
        &self.domains[id as usize]
    }

    /// Returns the CPUs which belong to `id`.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn cpus_of(&self, id: DomainId) -> CpuMask {
        self.domain(id).cpus
    }

    /// Returns the domain `cpu` belongs to, `None` if the CPU was never registered.
    pub fn domain_of(&self, cpu: CpuIndex) -> Option<&TlbDomain> {
        match *self.cpu_domain.get(cpu as usize)? {
            NO_DOMAIN => None,
            id => Some(&self.domains[id as usize]),
        }
    }

    /// Returns every registered CPU.
    pub fn all_cpus(&self) -> CpuMask {
        self.all
    }

    pub fn iter(&self) -> core::slice::Iter<'_, TlbDomain> {
        self.domains.iter()
    }

    pub fn geometry(&self) -> &SlotGeometry {
        &self.geometry
    }
}

impl<'a> IntoIterator for &'a DomainRegistry {
    type Item = &'a TlbDomain;
    type IntoIter = core::slice::Iter<'a, TlbDomain>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl core::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("geometry", &self.geometry)
            .field("domains", &self.domains)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> SlotGeometry {
        SlotGeometry::new(12, 32).unwrap()
    }

    fn mask(cpus: &[CpuIndex]) -> CpuMask {
        cpus.iter().copied().collect()
    }

    #[test]
    fn lookups() {
        let r = RegistryBuilder::new(geometry())
            .domain(mask(&[0, 1, 2]))
            .domain(mask(&[3]))
            .build()
            .unwrap();

        assert_eq!(r.domain_count(), 2);
        assert_eq!(r.domain_of(1).map(|d| d.id()), Some(0));
        assert_eq!(r.domain_of(3).map(|d| d.id()), Some(1));
        assert!(r.domain_of(4).is_none());
        assert!(r.domain_of(100_000).is_none());
        assert_eq!(r.cpus_of(0), mask(&[0, 1, 2]));
        assert_eq!(r.all_cpus(), mask(&[0, 1, 2, 3]));
        assert_eq!(r.iter().count(), 2);
    }

    #[test]
    fn rejects_bad_layouts() {
        assert_eq!(
            RegistryBuilder::new(geometry()).build().err(),
            Some(RegistryError::NoDomains)
        );
        assert_eq!(
            RegistryBuilder::new(geometry())
                .domain(mask(&[0]))
                .domain(CpuMask::new())
                .build()
                .err(),
            Some(RegistryError::EmptyDomain(1))
        );
        assert_eq!(
            RegistryBuilder::new(geometry())
                .domain(mask(&[0, 1]))
                .domain(mask(&[1, 2]))
                .build()
                .err(),
            Some(RegistryError::Overlap {
                cpu: 1,
                first: 0,
                second: 1
            })
        );
    }

    #[test]
    fn full_sync_generation() {
        let r = RegistryBuilder::new(geometry())
            .domain(mask(&[0, 1]))
            .build()
            .unwrap();
        let d = r.domain(0);
        assert_eq!(d.generation(), 0);
        assert_eq!(d.last_full_sync(), None);
        assert_eq!(d.complete_full_sync(1), 1);
        assert_eq!(d.complete_full_sync(0), 2);
        assert_eq!(d.generation(), 2);
        assert_eq!(d.last_full_sync(), Some(0));
    }
}
