//! Criterion benchmarks for decay-time PDF evaluation, extended NLL and sampling.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;

use tdcpv_core::LogDensityModel;
use tdcpv_model::{AnalysisSpecV0, CompiledAnalysis, CpFitModel, EventStore, compile_model};

const CONFIG: &str = r#"{
    "schema_version": "tdcpv_analysis_spec_v0",
    "observables": { "time": { "name": "t", "range": [0.4, 15.0] }, "charge": "qf" },
    "submodes": ["kkpi"],
    "taggers": [
        { "name": "os", "decision": "q_os",
          "calibration": { "p0": 0.396, "p1": 1.0, "avg_eta": 0.396 }, "efficiency": 0.403 },
        { "name": "ss", "decision": "q_ss",
          "calibration": { "p0": 0.44, "p1": 1.0, "avg_eta": 0.44 }, "efficiency": 0.6,
          "eta_domain": [0.3, 0.5] }
    ],
    "resolution": { "type": "mean", "components": [{ "sigma": 0.04, "fraction": 0.8 }, { "sigma": 0.09 }],
                    "scale": 1.15 },
    "acceptance": { "type": "spline", "knots": [0.5, 1.0, 2.0, 5.0, 10.0],
                    "coefficients": [0.4, 0.7, 0.95, 1.0, 1.02] },
    "processes": [{
        "name": "signal", "meson": "bs",
        "decay": { "gamma": 0.661, "delta_gamma": -0.105, "delta_m": 17.69 },
        "cp": { "type": "direct", "c": 0.932, "s": -0.083, "d": -1.348, "sbar": 1.158, "dbar": -0.783 },
        "yields": [{ "submode": "kkpi", "yield": { "type": "total", "value": 10000.0 } }]
    }]
}"#;

fn compiled() -> CompiledAnalysis {
    compile_model(&AnalysisSpecV0::from_json_str(CONFIG).unwrap()).unwrap()
}

fn dataset(analysis: &CompiledAnalysis, n_per_charge: usize) -> EventStore {
    let params = analysis.context.values();
    let mut rng = StdRng::seed_from_u64(42);
    let stores = analysis
        .components()
        .map(|c| {
            let proto = c.sample_proto(&analysis.layout, n_per_charge, &mut rng).unwrap();
            c.sample_main(&analysis.layout, &params, &proto, n_per_charge, &mut rng).unwrap()
        })
        .collect::<Vec<_>>();
    EventStore::concat(&stores).unwrap()
}

fn bench_nll(c: &mut Criterion) {
    let analysis = compiled();
    let mut group = c.benchmark_group("cp_nll");
    group.sample_size(20);
    for n in [1_000usize, 10_000] {
        let data = dataset(&analysis, n / 2);
        let model = CpFitModel::new(&analysis, &data).unwrap();
        let params = model.parameter_init();
        group.bench_with_input(BenchmarkId::new("two_taggers_spline", n), &n, |b, _| {
            b.iter(|| black_box(model.nll(black_box(&params)).unwrap()))
        });
    }
    group.finish();
}

fn bench_sample(c: &mut Criterion) {
    let analysis = compiled();
    let params = analysis.context.values();
    let prepared = analysis.processes[0].time.prepare(&params).unwrap();
    let eta = prepared.average_eta();
    let mut rng = StdRng::seed_from_u64(7);
    c.bench_function("sample_event", |b| {
        b.iter(|| black_box(prepared.sample_event(&mut rng, &eta, None, 1.0).unwrap()))
    });
}

criterion_group!(benches, bench_nll, bench_sample);
criterion_main!(benches);
