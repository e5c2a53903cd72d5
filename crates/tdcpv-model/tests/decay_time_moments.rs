//! Sampled decay-time moments against the analytic first moment.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tdcpv_model::{AnalysisSpecV0, compile_model};

fn config(acceptance: &str) -> String {
    format!(
        r#"{{
        "schema_version": "tdcpv_analysis_spec_v0",
        "observables": {{ "time": {{ "name": "t", "range": [0.4, 15.0] }}, "charge": "qf" }},
        "submodes": ["kkpi"],
        "taggers": [{{
            "name": "os", "decision": "q_os",
            "calibration": {{ "p0": 0.396, "p1": 1.0, "avg_eta": 0.396 }},
            "efficiency": 0.403
        }}],
        "resolution": {{ "type": "mean", "components": [{{ "sigma": 0.04 }}], "scale": 1.15 }},
        "acceptance": {acceptance},
        "processes": [{{
            "name": "signal", "meson": "bs",
            "decay": {{ "gamma": 0.661, "delta_gamma": -0.105, "delta_m": 17.69 }},
            "cp": {{ "type": "direct", "c": 0.932, "s": -0.083, "d": -1.348, "sbar": 1.158, "dbar": -0.783 }},
            "yields": [{{ "submode": "kkpi", "yield": {{ "type": "total", "value": 10000.0 }} }}]
        }}]
    }}"#
    )
}

/// Samples `n` events per final-state charge and checks the mean decay time of
/// each tag decision against the analytic first moment.
fn check_sampled_moments(acceptance: &str, seed: u64, n: usize) {
    let spec = AnalysisSpecV0::from_json_str(&config(acceptance)).unwrap();
    let compiled = compile_model(&spec).unwrap();
    let params = compiled.context.values();
    let time = &compiled.processes[0].time;
    let prepared = time.prepare(&params).unwrap();
    let eta = prepared.average_eta();
    let mut rng = StdRng::seed_from_u64(seed);

    for qf in [1.0, -1.0] {
        // (sum, sum of squares, count) per decision -1, 0, +1.
        let mut acc = [(0.0_f64, 0.0_f64, 0usize); 3];
        for _ in 0..n {
            let (t, q) = prepared.sample_event(&mut rng, &eta, None, qf).unwrap();
            let slot = &mut acc[(q[0] + 1) as usize];
            slot.0 += t;
            slot.1 += t * t;
            slot.2 += 1;
        }
        for (k, &(s, s2, count)) in acc.iter().enumerate() {
            let q = k as i8 - 1;
            assert!(count > n / 20, "{acceptance}: decision {q}: only {count} events");
            let nf = count as f64;
            let mean = s / nf;
            let var = s2 / nf - mean * mean;
            let expected = prepared.mean_time(&[q], &eta, None, qf).unwrap();
            let tol = 5.0 * (var / nf).sqrt();
            assert!(
                (mean - expected).abs() < tol,
                "{acceptance}: q={q}, qf={qf}: sample mean {mean:.4} vs analytic {expected:.4} (tol {tol:.4})"
            );
        }
    }
}

#[test]
fn sampled_mean_time_matches_first_moment_per_tag_and_charge() {
    check_sampled_moments(r#"{ "type": "none" }"#, 20_240_611, 10_000);
}

#[test]
fn sampled_mean_time_matches_first_moment_with_spline_acceptance() {
    let spline = r#"{ "type": "spline", "knots": [0.5, 1.0, 2.0, 5.0, 10.0],
                      "coefficients": [0.4, 0.7, 0.95, 1.0, 1.02] }"#;
    check_sampled_moments(spline, 11, 10_000);
}

#[test]
fn sampled_mean_time_matches_first_moment_with_power_law_acceptance() {
    let power_law = r#"{ "type": "power_law", "beta": 1.5, "exponent": 2.0, "offset": 0.1, "slope": -0.01 }"#;
    check_sampled_moments(power_law, 12, 10_000);
}

#[test]
fn sampled_mean_time_matches_first_moment_with_binned_acceptance() {
    let binned = r#"{ "type": "spline", "knots": [0.5, 1.0, 2.0, 5.0, 10.0],
                      "coefficients": [0.4, 0.7, 0.95, 1.0, 1.02], "binning": 200 }"#;
    check_sampled_moments(binned, 13, 10_000);
}

#[test]
fn binned_acceptance_matches_continuous_within_binning() {
    let spline = r#"{ "type": "spline", "knots": [0.5, 1.0, 2.0, 5.0, 10.0],
                      "coefficients": [0.4, 0.7, 0.95, 1.0, 1.02] }"#;
    let binned = r#"{ "type": "spline", "knots": [0.5, 1.0, 2.0, 5.0, 10.0],
                      "coefficients": [0.4, 0.7, 0.95, 1.0, 1.02], "binning": 400 }"#;
    let a = compile_model(&AnalysisSpecV0::from_json_str(&config(spline)).unwrap()).unwrap();
    let b = compile_model(&AnalysisSpecV0::from_json_str(&config(binned)).unwrap()).unwrap();
    assert!(b.processes[0].time.acceptance().nominal().binned().is_some());

    let params = a.context.values();
    let pa = a.processes[0].time.prepare(&params).unwrap();
    let pb = b.processes[0].time.prepare(&params).unwrap();
    let eta = pa.average_eta();
    for qf in [1.0, -1.0] {
        for q in [-1i8, 0, 1] {
            let ma = pa.mean_time(&[q], &eta, None, qf).unwrap();
            let mb = pb.mean_time(&[q], &eta, None, qf).unwrap();
            assert!((ma - mb).abs() < 5e-3 * ma, "q={q}, qf={qf}: {ma} vs {mb}");
        }
        let na = pa.normalisation(&eta, None, qf).unwrap();
        let nb = pb.normalisation(&eta, None, qf).unwrap();
        assert!((na - nb).abs() < 5e-3 * na, "qf={qf}: norm {na} vs {nb}");
    }
}

#[test]
fn same_seed_gives_identical_draws() {
    let spec = AnalysisSpecV0::from_json_str(&config(r#"{ "type": "none" }"#)).unwrap();
    let compiled = compile_model(&spec).unwrap();
    let params = compiled.context.values();
    let prepared = compiled.processes[0].time.prepare(&params).unwrap();
    let eta = prepared.average_eta();
    let draw = |seed: u64| {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..50).map(|_| prepared.sample_event(&mut rng, &eta, None, -1.0).unwrap()).collect::<Vec<_>>()
    };
    assert_eq!(draw(7), draw(7));
    assert_ne!(draw(7), draw(8));
}
