use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use muq_mcmc::core::{State, TransitionKernel};
use muq_mcmc::distributions::{Boomerang, TargetModel};
use muq_mcmc::kernel::{DrKernel, MhKernel, NutsKernel, NutsOptions};
use muq_mcmc::proposal::{AdaptSchedule, MhProposal};
use nalgebra::dvector;
use rand::rngs::SmallRng;
use rand::SeedableRng;

const STEPS: usize = 1_000;

fn run_steps(kernel: &mut dyn TransitionKernel, target: &dyn TargetModel) {
    let mut rng = SmallRng::seed_from_u64(42);
    let mut state = State::evaluate(target, dvector![0.0, 1.0], kernel.requirements())
        .expect("start state");
    for step in 1..=STEPS {
        state = kernel
            .step(step, target, &state, &mut rng)
            .expect("step")
            .state;
    }
}

fn bench_kernels(c: &mut Criterion) {
    let target = Boomerang::default();
    let schedule = AdaptSchedule {
        start: 100,
        interval: 50,
        scale: 2.4,
    };

    c.bench_function("mh_1000_steps", |b| {
        b.iter_batched(
            || MhKernel::new(&target, MhProposal::isotropic(2, 1.0).expect("proposal")).expect("kernel"),
            |mut kernel| run_steps(&mut kernel, &target),
            BatchSize::SmallInput,
        );
    });

    c.bench_function("dram_1000_steps", |b| {
        b.iter_batched(
            || DrKernel::dram(&target, 2.0, schedule, 3, 2.0, STEPS).expect("kernel"),
            |mut kernel| run_steps(&mut kernel, &target),
            BatchSize::SmallInput,
        );
    });

    c.bench_function("nuts_1000_steps", |b| {
        b.iter_batched(
            || {
                let options = NutsOptions {
                    adapt_steps: 200,
                    ..NutsOptions::default()
                };
                NutsKernel::new(&target, options).expect("kernel")
            },
            |mut kernel| run_steps(&mut kernel, &target),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_kernels);
criterion_main!(benches);
