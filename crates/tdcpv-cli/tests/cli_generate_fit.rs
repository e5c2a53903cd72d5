use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tdcpv"))
}

fn repo_root() -> PathBuf {
    // crates/tdcpv-cli -> repo root
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").canonicalize().unwrap()
}

fn fixture_path(name: &str) -> PathBuf {
    repo_root().join("tests/fixtures").join(name)
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("tdcpv_cli_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn read_json(path: &PathBuf) -> serde_json::Value {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    serde_json::from_str(&text).expect("output should be valid JSON")
}

#[test]
fn version_smoke() {
    let out = run(&["version"]);
    assert!(out.status.success(), "version should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("tdcpv "), "unexpected stdout: {}", stdout);
}

#[test]
fn validate_reports_cells_and_parameters() {
    let config = fixture_path("tdcpv_simple.json");
    assert!(config.exists(), "missing fixture: {}", config.display());

    let out = run(&["validate", "--config", config.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "validate should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON");

    let cells = v.get("cells").and_then(|x| x.as_array()).expect("cells should be an array");
    assert_eq!(cells.len(), 2, "one cell per final-state charge");
    assert_eq!(cells[0]["process"], "signal");
    let free = v.get("free_parameters").and_then(|x| x.as_u64()).expect("free_parameters");
    // signal_C, signal_S and the two yields.
    assert_eq!(free, 4);
    assert!(v["generation_error"].is_null());
    let observables: Vec<&str> =
        v["observables"].as_array().unwrap().iter().map(|o| o.as_str().unwrap()).collect();
    assert_eq!(observables[..4], ["t", "sigma_t", "q_os", "eta_os"]);
}

#[test]
fn generate_then_fit_round_trip() {
    let config = fixture_path("tdcpv_simple.json");
    let data = tmp_path("toy.json");
    let fit_out = tmp_path("fit.json");

    let out = run(&[
        "generate",
        "--config",
        config.to_string_lossy().as_ref(),
        "--seed",
        "17",
        "--output",
        data.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "generate should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let ws = read_json(&data);
    assert_eq!(ws["schema_version"], "tdcpv_workspace_v0");
    assert_eq!(ws["seed"], 17);

    let out = run(&[
        "fit",
        "--config",
        config.to_string_lossy().as_ref(),
        "--data",
        data.to_string_lossy().as_ref(),
        "--output",
        fit_out.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "fit should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let v = read_json(&fit_out);
    let names = v["parameter_names"].as_array().expect("parameter_names should be an array");
    let bestfit = v["bestfit"].as_array().expect("bestfit should be an array");
    let unc = v["uncertainties"].as_array().expect("uncertainties should be an array");
    assert_eq!(bestfit.len(), names.len());
    assert_eq!(unc.len(), names.len());
    assert!(v["nll"].as_f64().expect("nll should be a number").is_finite());
    assert!(v["converged"].is_boolean());

    let pulls = v["pulls"].as_object().expect("pulls should be an object");
    let s_pull = pulls.get("signal_S").and_then(|x| x.as_f64()).expect("pull of signal_S");
    assert!(s_pull.abs() < 5.0, "signal_S pull {s_pull}");

    let _ = std::fs::remove_file(&data);
    let _ = std::fs::remove_file(&fit_out);
}

#[test]
fn generate_many_toys_writes_indexed_files() {
    let config = fixture_path("tdcpv_simple.json");
    let base = tmp_path("batch.json");
    let out = run(&[
        "generate",
        "--config",
        config.to_string_lossy().as_ref(),
        "--seed",
        "5",
        "--toys",
        "2",
        "--output",
        base.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "generate should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let stem = base.file_stem().unwrap().to_string_lossy().into_owned();
    for (i, seed) in [(0, 5), (1, 6)] {
        let path = base.with_file_name(format!("{stem}_{i}.json"));
        let ws = read_json(&path);
        assert_eq!(ws["seed"], seed);
        let _ = std::fs::remove_file(&path);
    }
}

#[test]
fn invalid_config_fails() {
    let bad = tmp_path("bad.json");
    std::fs::write(&bad, r#"{"schema_version": "something_else"}"#).unwrap();
    let out = run(&["validate", "--config", bad.to_string_lossy().as_ref()]);
    assert!(!out.status.success(), "validate should fail for a bad config");
    let _ = std::fs::remove_file(&bad);
}
