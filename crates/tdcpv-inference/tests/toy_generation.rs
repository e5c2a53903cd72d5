//! Toy generation: determinism, stream independence, degenerate cells and fit round-trips.

use tdcpv_core::{Error, LogDensityModel};
use tdcpv_inference::{MaximumLikelihoodEstimator, ToySampler, pull};
use tdcpv_model::{AnalysisSpecV0, CompiledAnalysis, CpFitModel, compile_model};

fn signal_process(total: f64) -> serde_json::Value {
    serde_json::json!({
        "name": "signal", "meson": "bs",
        "decay": { "gamma": 0.661, "delta_gamma": -0.105, "delta_m": 17.69 },
        "cp": { "type": "direct", "c": 0.932, "s": -0.083, "d": -1.348, "sbar": 1.158, "dbar": -0.783 },
        "detection_asymmetry": 0.02,
        "yields": [{ "submode": "kkpi", "yield": { "type": "total", "value": total } }]
    })
}

fn background_process() -> serde_json::Value {
    serde_json::json!({
        "name": "ds_pi", "meson": "bs",
        "decay": { "gamma": 0.661, "delta_gamma": -0.105, "delta_m": 17.69 },
        "cp": { "type": "flavour_specific" },
        "yields": [{ "submode": "kkpi", "yield": { "type": "per_charge", "plus": 150.0, "minus": 140.0 } }]
    })
}

fn config(processes: Vec<serde_json::Value>, constant: &[&str]) -> AnalysisSpecV0 {
    let v = serde_json::json!({
        "schema_version": "tdcpv_analysis_spec_v0",
        "observables": {
            "time": { "name": "t", "range": [0.4, 15.0] },
            "time_error": { "name": "sigma_t", "range": [0.01, 0.1] },
            "charge": "qf"
        },
        "submodes": ["kkpi"],
        "taggers": [{
            "name": "os", "decision": "q_os",
            "calibration": { "p0": 0.37, "p1": 1.0, "avg_eta": 0.37 },
            "mistag": { "type": "per_event", "column": "eta_os",
                        "pdf": { "type": "mock", "mean": 0.37, "sigma": 0.07 } },
            "efficiency": 0.5
        }],
        "resolution": {
            "type": "per_event", "scale": 1.0, "offset": 0.005,
            "time_error_pdf": { "type": "mock", "exponent": 2.0, "tau": 0.012 }
        },
        "processes": processes,
        "constant_params": constant
    });
    serde_json::from_value(v).unwrap()
}

fn compiled(processes: Vec<serde_json::Value>) -> CompiledAnalysis {
    compile_model(&config(processes, &[])).unwrap()
}

#[test]
fn same_seed_same_dataset() {
    let analysis = compiled(vec![signal_process(400.0)]);
    let sampler = ToySampler::new(&analysis).unwrap();
    let params = analysis.context.values();
    let a = sampler.generate(&params, 11).unwrap();
    let b = sampler.generate(&params, 11).unwrap();
    let c = sampler.generate(&params, 12).unwrap();
    assert_eq!(a.events.column("t"), b.events.column("t"));
    assert_eq!(a.events.column("eta_os"), b.events.column("eta_os"));
    assert_ne!(a.events.column("t"), c.events.column("t"));
    assert_eq!(a.events.n_events(), 400);
    assert_eq!(a.cells[0].generated + a.cells[1].generated, 400);
}

#[test]
fn proto_columns_respect_their_domains() {
    let analysis = compiled(vec![signal_process(500.0)]);
    let params = analysis.context.values();
    let toy = ToySampler::new(&analysis).unwrap().generate(&params, 3).unwrap();
    let eta = toy.events.column("eta_os").unwrap();
    let sigma = toy.events.column("sigma_t").unwrap();
    assert!(eta.iter().all(|&x| (0.0..=0.5).contains(&x)));
    assert!(sigma.iter().all(|&x| (0.01..=0.1).contains(&x)));
    let q = toy.events.column("q_os").unwrap();
    let tagged = q.iter().filter(|&&x| x != 0.0).count() as f64 / q.len() as f64;
    assert!((tagged - 0.5).abs() < 0.1, "tagged fraction {tagged}");
}

#[test]
fn adding_a_process_does_not_change_other_cells() {
    let alone = compiled(vec![signal_process(300.0)]);
    let both = compiled(vec![signal_process(300.0), background_process()]);
    let a = ToySampler::new(&alone).unwrap().generate(&alone.context.values(), 99).unwrap();
    let b = ToySampler::new(&both).unwrap().generate(&both.context.values(), 99).unwrap();

    let signal_times = |events: &tdcpv_model::EventStore| -> Vec<f64> {
        let id = events.column("true_id").unwrap();
        let t = events.column("t").unwrap();
        id.iter().zip(t).filter(|(i, _)| **i == 0.0).map(|(_, t)| *t).collect()
    };
    assert_eq!(b.events.n_events(), 300 + 290);
    assert_eq!(signal_times(&a.events), signal_times(&b.events));
}

#[test]
fn zero_entries_is_degenerate() {
    let analysis = compiled(vec![signal_process(0.4)]);
    let err = ToySampler::new(&analysis).unwrap().generate(&analysis.context.values(), 1).unwrap_err();
    assert!(matches!(err, Error::DegenerateData(_)), "{err}");
    let msg = err.to_string();
    assert!(msg.contains("'signal'") && msg.contains("'kkpi'"), "{msg}");
}

fn fit_pulls(seed: u64, total: f64) -> Vec<(String, f64)> {
    let spec = config(
        vec![signal_process(total)],
        &["bs_*", "os_*", "resolution_*", "signal_D*", "signal_Sbar", "signal_aprod"],
    );
    let analysis = compile_model(&spec).unwrap();
    let truth = analysis.context.values();
    let toy = ToySampler::new(&analysis).unwrap().generate(&truth, seed).unwrap();
    let model = CpFitModel::new(&analysis, &toy.events).unwrap();
    let fit = MaximumLikelihoodEstimator::new().fit(&model).unwrap();
    assert!(fit.nll <= model.nll(&model.parameter_init()).unwrap() + 1e-6);

    let generated = |name: &str| {
        let id = analysis.context.require_param(name).unwrap();
        analysis.context.param(id).value
    };
    fit.parameter_names
        .iter()
        .map(|name| {
            let p = pull(fit.value(name).unwrap(), generated(name), fit.error(name).unwrap())
                .unwrap_or(f64::NAN);
            (name.clone(), p)
        })
        .collect()
}

#[test]
fn fit_recovers_generated_values() {
    let pulls = fit_pulls(2024, 3000.0);
    assert!(pulls.iter().any(|(n, _)| n == "signal_S"));
    for (name, p) in pulls {
        assert!(p.is_finite() && p.abs() < 5.0, "{name}: pull {p}");
    }
}

#[test]
#[ignore = "replica study; run with --ignored"]
fn pull_distribution_is_standard_normal() {
    let n_toys = 50;
    let mut s_pulls = Vec::with_capacity(n_toys);
    for i in 0..n_toys {
        let pulls = fit_pulls(1000 + i as u64, 3000.0);
        if let Some((_, p)) = pulls.into_iter().find(|(n, _)| n == "signal_S") {
            s_pulls.push(p);
        }
    }
    let n = s_pulls.len() as f64;
    let mean = s_pulls.iter().sum::<f64>() / n;
    let width = (s_pulls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    assert!(mean.abs() < 0.5, "mean pull {mean}");
    assert!((0.7..1.3).contains(&width), "pull width {width}");
}
