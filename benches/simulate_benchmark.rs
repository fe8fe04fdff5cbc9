// Measures one full simulation run (history updates, covariate draws and
// risk aggregation) as the cohort grows.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gformula::history::HistorySpec;
use gformula::model::{CovariateFit, FittedModels, LinearModel, LinkFunction, Term};
use gformula::spec::{CovariateKind, CovariateSpec, OutcomeSpec, OutcomeType, SimulationSpec};
use gformula::{Intervention, InterventionRule, Pool, Simulator, TreatmentRule};
use std::sync::Arc;

const TIME_POINTS: usize = 10;
const COHORT_SIZES: [usize; 3] = [1_000, 10_000, 50_000];

fn simulator() -> Simulator {
    let covariate_model = LinearModel::new(LinkFunction::Identity, 0.5)
        .with_term(Term::new("lag1_L", 0.6))
        .with_term(Term::new("cumavg_L", 0.1));
    let treatment_model = LinearModel::new(LinkFunction::Logit, -1.0).with_term(Term::new("L", 0.4));
    let outcome_model = LinearModel::new(LinkFunction::Logit, -4.0)
        .with_term(Term::new("A", -0.5))
        .with_term(Term::new("lag1_A", 0.2))
        .with_term(Term::new("L", 0.3));

    let covariates = vec![
        CovariateSpec::new("L", CovariateKind::Normal),
        CovariateSpec::new("A", CovariateKind::Binary),
    ];
    let terms: Vec<&str> = covariate_model
        .columns()
        .chain(treatment_model.columns())
        .chain(outcome_model.columns())
        .collect();
    let mut spec = SimulationSpec::new(TIME_POINTS, OutcomeSpec::new("Y", OutcomeType::Survival));
    spec.history = HistorySpec::derive(&covariates, &[], terms, false).expect("history plan");
    spec.covariates = covariates;

    let models = FittedModels::new(Arc::new(outcome_model.clone()))
        .with_covariate("L", CovariateFit::Mean(Arc::new(covariate_model.clone())))
        .with_covariate("A", CovariateFit::Mean(Arc::new(treatment_model.clone())))
        .with_rmse("L", 0.5)
        .with_bounds("L", (-5.0, 5.0));
    Simulator::new(spec, models).expect("valid specification")
}

fn cohort(n: usize) -> Pool {
    Pool::from_columns(
        "id",
        "t0",
        (0..n as i64).collect(),
        vec![0; n],
        vec![
            ("L".to_string(), (0..n).map(|i| (i % 7) as f64 / 7.0).collect()),
            ("A".to_string(), (0..n).map(|i| (i % 2) as f64).collect()),
        ],
    )
    .expect("cohort")
}

fn bench_simulation(c: &mut Criterion) {
    let simulator = simulator();
    let always = Intervention::new("always")
        .with_rule(TreatmentRule::new("A", InterventionRule::Static { values: vec![1.0] }));

    let mut group = c.benchmark_group("simulate");
    group.sample_size(10);
    for &n in &COHORT_SIZES {
        let cohort = cohort(n);
        group.throughput(Throughput::Elements((n * TIME_POINTS) as u64));
        group.bench_with_input(BenchmarkId::new("natural_course", n), &cohort, |b, cohort| {
            b.iter(|| {
                simulator
                    .run(black_box(cohort), &Intervention::natural_course(), 1)
                    .expect("simulation")
            })
        });
        group.bench_with_input(BenchmarkId::new("static_intervention", n), &cohort, |b, cohort| {
            b.iter(|| simulator.run(black_box(cohort), &always, 1).expect("simulation"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_simulation);
criterion_main!(benches);
