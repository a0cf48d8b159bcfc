use crate::config::{Expectation, Step, StressConfig};
use crate::machine::{CpuMode, Machine};
use crate::SimError;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use std::sync::Barrier;
use synci::{CpuIndex, StatsSnapshot};

/// Runs `steps` on `machine` in order, stopping at the first failed step.
pub fn replay(machine: &Machine, steps: &[Step]) -> Result<(), SimError> {
    for (i, step) in steps.iter().enumerate() {
        log::debug!("step {i}: {step:?}");
        match step {
            Step::Request { cpu, page, on_proc } => machine.write_page(*cpu, *page, on_proc)?,
            Step::Deliver { cpu } => machine.deliver(*cpu)?,
            Step::EnterKernel { cpu } => machine.enter_kernel(*cpu)?,
            Step::EnterUser { cpu } => machine.enter_user(*cpu)?,
            Step::ReturnToUser { cpu } => machine.return_to_user(*cpu)?,
            Step::Execute { cpu, page } => {
                if !machine.execute(*cpu, *page)? {
                    return Err(SimError::Stale {
                        step: i,
                        cpu: *cpu,
                        page: *page,
                    });
                }
            }
            Step::Expect(e) => check(i, e, &machine.coordinator().stats())?,
        }
    }
    Ok(())
}

fn check(step: usize, e: &Expectation, s: &StatsSnapshot) -> Result<(), SimError> {
    macro_rules! expect {
        ($($name:ident),*) => {
            $(
                if let Some(expected) = e.$name {
                    if expected != s.$name {
                        return Err(SimError::Expectation {
                            step,
                            counter: stringify!($name),
                            expected,
                            actual: s.$name,
                        });
                    }
                }
            )*
        };
    }
    expect!(
        requests,
        duplicates,
        joined,
        full_syncs,
        pages_synced,
        ipis_sent,
        ast_wakes,
        local_wakes,
        deferred_wakes,
        resume_wakes
    );
    Ok(())
}

/// Operations each worker runs between two idle checks.
const ROUND: u64 = 64;

/// Runs a random workload with one thread for each online CPU.
///
/// Stale instructions can legitimately be observed while requests are in flight. Workers check
/// their domain every time they synchronize and the workers meet after every [ROUND] operations:
/// each takes its interrupts, then no domain whose CPUs all run user code may be left stale. Once
/// every CPU has passed through the return to user path again no domain may have pending slots or
/// stale pages.
pub fn stress(machine: &Machine, cfg: &StressConfig) -> Result<(), SimError> {
    let online = machine.online_cpus();
    log::info!(
        "stress: {} CPU(s), {} iterations each, seed {:#x}",
        online.len(),
        cfg.iterations,
        cfg.seed
    );
    let barrier = Barrier::new(online.len());

    std::thread::scope(|s| {
        let mut workers = Vec::with_capacity(online.len());
        for &cpu in &online {
            let (online, barrier) = (&online, &barrier);
            let h = std::thread::Builder::new()
                .name(format!("cpu{cpu}"))
                .spawn_scoped(s, move || worker(machine, cfg, cpu, online, barrier))?;
            workers.push((cpu, h));
        }
        for (cpu, h) in workers {
            h.join().map_err(|_| SimError::Worker(cpu))??;
        }
        Ok::<_, SimError>(())
    })?;

    for &cpu in &online {
        machine.enter_kernel(cpu)?;
        machine.return_to_user(cpu)?;
    }
    for &cpu in &online {
        for page in 0..cfg.pages {
            if !machine.execute(cpu, page)? {
                return Err(SimError::Inconsistent);
            }
        }
    }
    if !machine.is_consistent() {
        return Err(SimError::Inconsistent);
    }
    Ok(())
}

fn worker(
    machine: &Machine,
    cfg: &StressConfig,
    cpu: CpuIndex,
    online: &[CpuIndex],
    barrier: &Barrier,
) -> Result<(), SimError> {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(cfg.seed ^ u64::from(cpu));
    let mut on_proc = Vec::with_capacity(online.len());

    let mut done = 0;
    while done < cfg.iterations {
        let round = ROUND.min(cfg.iterations - done);
        for _ in 0..round {
            step(machine, cfg, cpu, online, &mut rng, &mut on_proc)?;
        }
        done += round;

        barrier.wait();
        let taken = machine.take_interrupts(cpu);
        if barrier.wait().is_leader() {
            let unwoken = machine.check_idle();
            if unwoken != 0 {
                log::error!("{unwoken} domain(s) left stale after {done} iterations");
            }
        }
        barrier.wait();
        taken?;
    }
    Ok(())
}

fn step(
    machine: &Machine,
    cfg: &StressConfig,
    cpu: CpuIndex,
    online: &[CpuIndex],
    rng: &mut rand_chacha::ChaCha8Rng,
    on_proc: &mut Vec<CpuIndex>,
) -> Result<(), SimError> {
    let roll = rng.next_u32() % 100;
    if roll < cfg.write_ratio {
        let page = rng.next_u64() % cfg.pages.max(1);
        let targets = rng.next_u64();
        on_proc.clear();
        on_proc.extend(
            online
                .iter()
                .enumerate()
                .filter(|(i, _)| targets & (1 << (i % 64)) != 0)
                .map(|(_, c)| *c),
        );
        return machine.write_page(cpu, page, on_proc);
    }

    match (machine.mode(cpu)?, roll % 4) {
        // user code keeps running, only the interrupts can make it synchronize
        (CpuMode::User, 0) => machine.enter_kernel(cpu),
        (CpuMode::User, _) => machine.take_interrupts(cpu),
        (_, 0 | 1) => machine.take_interrupts(cpu),
        (_, _) => machine.return_to_user(cpu),
    }
}
