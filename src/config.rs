//! Machine and workload descriptions.
//!
//! ```toml
//! page_shift = 12
//! icache_way_size = 0x20000
//!
//! [[domain]]
//! cpus = [0, 1, 2]
//! user = [1]
//!
//! [[step]]
//! op = "request"
//! cpu = 2
//! page = 5
//! on_proc = [0, 1]
//! ```

use crate::SimError;
use serde::Deserialize;
use synci::{CpuIndex, CpuMask, RegistryBuilder, SlotGeometry};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_page_shift")]
    pub page_shift: u32,
    /// Size of one instruction cache way in bytes. Ignored when `slots` is given.
    pub icache_way_size: Option<usize>,
    /// Explicit width of the pending page bitmaps.
    pub slots: Option<u32>,
    pub log_level: Option<String>,
    #[serde(rename = "domain")]
    pub domains: Vec<DomainConfig>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
    pub stress: Option<StressConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub cpus: Vec<CpuIndex>,
    /// CPUs which start out running user code.
    #[serde(default)]
    pub user: Vec<CpuIndex>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// The mapping layer on `cpu` rewrote `page` which may be executing on `on_proc`.
    Request {
        cpu: CpuIndex,
        page: u64,
        on_proc: Vec<CpuIndex>,
    },
    /// `cpu` handles every interrupt waiting for it.
    Deliver { cpu: CpuIndex },
    /// `cpu` leaves user mode, through a trap or because it went idle.
    EnterKernel { cpu: CpuIndex },
    /// `cpu` runs its ASTs and resumes user code without taking the interrupts waiting for it.
    EnterUser { cpu: CpuIndex },
    /// `cpu` handles its interrupts, then runs its ASTs and resumes user code.
    ReturnToUser { cpu: CpuIndex },
    /// `cpu` executes `page`, which must not be stale if it is in user mode.
    Execute { cpu: CpuIndex, page: u64 },
    /// Checks the accumulated counters. Counters which are not given are not checked.
    Expect(Expectation),
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    pub requests: Option<u64>,
    pub duplicates: Option<u64>,
    pub joined: Option<u64>,
    pub full_syncs: Option<u64>,
    pub pages_synced: Option<u64>,
    pub ipis_sent: Option<u64>,
    pub ast_wakes: Option<u64>,
    pub local_wakes: Option<u64>,
    pub deferred_wakes: Option<u64>,
    pub resume_wakes: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StressConfig {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default)]
    pub seed: u64,
    /// Number of distinct pages the workload writes to.
    #[serde(default = "default_pages")]
    pub pages: u64,
    /// Percentage of iterations which modify a page.
    #[serde(default = "default_write_ratio")]
    pub write_ratio: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: 0,
            pages: default_pages(),
            write_ratio: default_write_ratio(),
        }
    }
}

fn default_page_shift() -> u32 {
    12
}

fn default_iterations() -> u64 {
    10_000
}

fn default_pages() -> u64 {
    256
}

fn default_write_ratio() -> u32 {
    25
}

impl Config {
    pub fn parse(s: &str) -> Result<Self, SimError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), SimError> {
        let cpus = self.cpu_count();
        for d in &self.domains {
            if let Some(cpu) = d.user.iter().find(|c| !d.cpus.contains(c)) {
                return Err(SimError::Config(format!(
                    "CPU {cpu} is marked as user but is not in its domain"
                )));
            }
        }
        for (i, s) in self.steps.iter().enumerate() {
            let (cpu, extra) = match s {
                Step::Request { cpu, on_proc, .. } => (*cpu, on_proc.as_slice()),
                Step::Deliver { cpu }
                | Step::EnterKernel { cpu }
                | Step::EnterUser { cpu }
                | Step::ReturnToUser { cpu }
                | Step::Execute { cpu, .. } => (*cpu, &[][..]),
                Step::Expect(_) => continue,
            };
            if let Some(bad) = core::iter::once(&cpu).chain(extra).find(|c| **c as usize >= cpus) {
                return Err(SimError::Config(format!("step {i} names unknown CPU {bad}")));
            }
        }
        Ok(())
    }

    pub fn geometry(&self) -> Result<SlotGeometry, SimError> {
        let g = match (self.slots, self.icache_way_size) {
            (Some(slots), _) => SlotGeometry::new(self.page_shift, slots),
            (None, Some(way)) => SlotGeometry::from_icache(way, self.page_shift),
            (None, None) => SlotGeometry::new(self.page_shift, 32),
        };
        g.ok_or_else(|| SimError::Config("invalid slot geometry".into()))
    }

    /// Number of simulated CPUs, one more than the highest CPU named by a domain.
    pub fn cpu_count(&self) -> usize {
        self.domains
            .iter()
            .flat_map(|d| d.cpus.iter())
            .map(|c| *c as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn registry(&self) -> Result<synci::DomainRegistry, SimError> {
        let mut b = RegistryBuilder::new(self.geometry()?);
        for d in &self.domains {
            let mut m = CpuMask::new();
            for cpu in &d.cpus {
                if *cpu as usize >= synci::mp::MAX_CPUS {
                    return Err(SimError::Config(format!("CPU {cpu} is out of range")));
                }
                m.set(*cpu);
            }
            b = b.domain(m);
        }
        Ok(b.build()?)
    }

    pub fn log_level(&self) -> Option<log::LevelFilter> {
        self.log_level.as_deref()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
        page_shift = 12
        icache_way_size = 0x20000

        [[domain]]
        cpus = [0, 1, 2]
        user = [1]

        [[domain]]
        cpus = [3]

        [[step]]
        op = "request"
        cpu = 2
        page = 5
        on_proc = [0, 1]

        [[step]]
        op = "return_to_user"
        cpu = 1

        [[step]]
        op = "expect"
        requests = 1
        ipis_sent = 2
    "#;

    #[test]
    fn parse_scenario() {
        let cfg = Config::parse(SCENARIO).unwrap();
        assert_eq!(cfg.cpu_count(), 4);
        assert_eq!(cfg.geometry().unwrap().slots(), 32);
        assert_eq!(
            cfg.steps[0],
            Step::Request {
                cpu: 2,
                page: 5,
                on_proc: vec![0, 1]
            }
        );
        assert_eq!(cfg.steps[1], Step::ReturnToUser { cpu: 1 });
        assert_eq!(
            cfg.steps[2],
            Step::Expect(Expectation {
                requests: Some(1),
                ipis_sent: Some(2),
                ..Default::default()
            })
        );
        let r = cfg.registry().unwrap();
        assert_eq!(r.domain_count(), 2);
        assert!(cfg.stress.is_none());
    }

    #[test]
    fn rejects_unknown_cpu() {
        let s = r#"
            [[domain]]
            cpus = [0, 1]

            [[step]]
            op = "enter_kernel"
            cpu = 9
        "#;
        assert!(matches!(Config::parse(s), Err(SimError::Config(_))));
    }

    #[test]
    fn rejects_overlapping_domains() {
        let s = r#"
            [[domain]]
            cpus = [0, 1]

            [[domain]]
            cpus = [1, 2]
        "#;
        let cfg = Config::parse(s).unwrap();
        assert!(matches!(cfg.registry(), Err(SimError::Registry(_))));
    }

    #[test]
    fn explicit_slots_win() {
        let s = r#"
            slots = 3
            icache_way_size = 0x20000
            log_level = "debug"

            [[domain]]
            cpus = [0]

            [stress]
            iterations = 10
        "#;
        let cfg = Config::parse(s).unwrap();
        assert_eq!(cfg.geometry().unwrap().slots(), 3);
        assert_eq!(cfg.log_level(), Some(log::LevelFilter::Debug));
        let stress = cfg.stress.unwrap();
        assert_eq!(stress.iterations, 10);
        assert_eq!(stress.pages, 256);
    }
}
