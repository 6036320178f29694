//! Integration tests for the cgmm CLI.
//!
//! Fits run on the CPU backend so they pass on machines without a GPU.
//!
//! Run with: `cargo test --package color-gmm-cli --test cli_integration`

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const ENV_VARS: [&str; 6] = [
    "CGMM_CLUSTERS",
    "CGMM_ITERATIONS",
    "CGMM_STEP_DELAY_MS",
    "CGMM_COLOR_SPACE",
    "CGMM_BACKEND",
    "RUST_LOG",
];

/// Helper to run cgmm inside `dir` with an isolated config directory.
fn run_cgmm(dir: &Path, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_cgmm"));
    command
        .current_dir(dir)
        .args(args)
        .env("CGMM_CONFIG_DIR", dir.join("config"));
    for var in ENV_VARS {
        command.env_remove(var);
    }
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("Failed to execute cgmm command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// One pure red pixel next to one pure blue pixel.
fn write_red_blue(dir: &Path) -> PathBuf {
    let path = dir.join("red_blue.png");
    let img = image::RgbImage::from_fn(2, 1, |x, _| {
        if x == 0 {
            image::Rgb([255, 0, 0])
        } else {
            image::Rgb([0, 0, 255])
        }
    });
    img.save(&path).unwrap();
    path
}

/// A 16x16 gradient with many populated bins.
fn write_gradient(dir: &Path) -> PathBuf {
    let path = dir.join("gradient.png");
    let img = image::RgbImage::from_fn(16, 16, |x, y| {
        image::Rgb([(x * 16) as u8, (y * 16) as u8, ((x + y) * 8) as u8])
    });
    img.save(&path).unwrap();
    path
}

fn parse_json(output: &Output) -> serde_json::Value {
    serde_json::from_str(&stdout(output)).expect("stdout should be valid JSON")
}

// =============================================================================
// Fit Command Tests
// =============================================================================

#[test]
fn test_fit_red_blue_json() {
    let temp = TempDir::new().unwrap();
    let image = write_red_blue(temp.path());

    let output = run_cgmm(
        temp.path(),
        &[
            "fit",
            image.to_str().unwrap(),
            "--backend",
            "cpu",
            "-k",
            "2",
            "-n",
            "3",
            "--format",
            "json",
        ],
        &[],
    );
    assert!(output.status.success(), "fit should succeed: {}", stderr(&output));

    let report = parse_json(&output);
    assert_eq!(report["backend"], "cpu");
    assert_eq!(report["populated_bins"], 2);
    assert_eq!(report["iterations"], 3);
    assert_eq!(report["cancelled"], false);
    assert_eq!(report["width"], 2);

    let clusters = report["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0]["hex"], "#ff0000");
    assert_eq!(clusters[1]["hex"], "#0000ff");
    for cluster in clusters {
        let fraction = cluster["fraction"].as_f64().unwrap();
        assert!((fraction - 0.5).abs() < 1e-2, "fraction {fraction}");
    }
    assert!(report.get("bins").is_none());
}

#[test]
fn test_fit_writes_output_file() {
    let temp = TempDir::new().unwrap();
    let image = write_gradient(temp.path());
    let out = temp.path().join("report.json");

    let output = run_cgmm(
        temp.path(),
        &[
            "fit",
            image.to_str().unwrap(),
            "--backend",
            "cpu",
            "-k",
            "4",
            "-n",
            "5",
            "--output",
            out.to_str().unwrap(),
        ],
        &[],
    );
    assert!(output.status.success(), "fit should succeed: {}", stderr(&output));
    assert!(stdout(&output).contains("Populated bins"));

    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    let clusters = report["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 4);
    let total: f64 = clusters
        .iter()
        .map(|c| c["fraction"].as_f64().unwrap())
        .sum();
    assert!((total - 1.0).abs() < 1e-3, "fractions sum to {total}");
}

#[test]
fn test_fit_reports_top_bins() {
    let temp = TempDir::new().unwrap();
    let image = write_gradient(temp.path());

    let output = run_cgmm(
        temp.path(),
        &[
            "fit",
            image.to_str().unwrap(),
            "--backend",
            "cpu",
            "-k",
            "3",
            "-n",
            "2",
            "--bins",
            "5",
            "--format",
            "json",
        ],
        &[],
    );
    assert!(output.status.success(), "fit should succeed: {}", stderr(&output));

    let report = parse_json(&output);
    let bins = report["bins"].as_array().unwrap();
    assert_eq!(bins.len(), 5);
    let counts: Vec<u64> = bins.iter().map(|b| b["count"].as_u64().unwrap()).collect();
    assert!(counts.windows(2).all(|w| w[0] >= w[1]));
    for bin in bins {
        assert!(bin["cluster"].as_u64().unwrap() < 3);
    }
}

#[test]
fn test_fit_uses_environment_configuration() {
    let temp = TempDir::new().unwrap();
    let image = write_gradient(temp.path());

    let output = run_cgmm(
        temp.path(),
        &["fit", image.to_str().unwrap(), "--format", "json"],
        &[
            ("CGMM_BACKEND", "cpu"),
            ("CGMM_CLUSTERS", "3"),
            ("CGMM_ITERATIONS", "2"),
            ("CGMM_COLOR_SPACE", "linear"),
        ],
    );
    assert!(output.status.success(), "fit should succeed: {}", stderr(&output));

    let report = parse_json(&output);
    assert_eq!(report["clusters"].as_array().unwrap().len(), 3);
    assert_eq!(report["iterations"], 2);
    assert_eq!(report["color_space"], "linear");
}

#[test]
fn test_fit_rejects_out_of_range_clusters() {
    let temp = TempDir::new().unwrap();
    let image = write_red_blue(temp.path());

    let output = run_cgmm(
        temp.path(),
        &["fit", image.to_str().unwrap(), "--backend", "cpu", "-k", "1"],
        &[],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid fit configuration"));

    let output = run_cgmm(
        temp.path(),
        &["fit", image.to_str().unwrap(), "--backend", "cpu", "-n", "65"],
        &[],
    );
    assert!(!output.status.success());
}

#[test]
fn test_fit_missing_image_fails() {
    let temp = TempDir::new().unwrap();

    let output = run_cgmm(temp.path(), &["fit", "nope.png", "--backend", "cpu"], &[]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Failed to open image"));
}

#[test]
fn test_invalid_environment_value_fails() {
    let temp = TempDir::new().unwrap();

    let output = run_cgmm(temp.path(), &["seeds"], &[("CGMM_ITERATIONS", "many")]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("CGMM_ITERATIONS"));
}

// =============================================================================
// Seeds Command Tests
// =============================================================================

#[test]
fn test_seeds_json() {
    let temp = TempDir::new().unwrap();

    let output = run_cgmm(temp.path(), &["seeds", "4", "--format", "json"], &[]);
    assert!(output.status.success());

    let seeds = parse_json(&output);
    let seeds = seeds.as_array().unwrap();
    assert_eq!(seeds.len(), 4);
    let first: Vec<f64> = seeds[0]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    assert!((first[0] - 0.5).abs() < 1e-6);
    assert!((first[1] - 0.25).abs() < 1e-6);
}

#[test]
fn test_seeds_follow_precedence() {
    let temp = TempDir::new().unwrap();

    // Default
    let output = run_cgmm(temp.path(), &["seeds"], &[]);
    assert_eq!(stdout(&output).lines().count(), 8);

    // Config file
    let output = run_cgmm(temp.path(), &["config", "set", "clusters", "5"], &[]);
    assert!(output.status.success(), "{}", stderr(&output));
    let output = run_cgmm(temp.path(), &["seeds"], &[]);
    assert_eq!(stdout(&output).lines().count(), 5);

    // Environment over file
    let output = run_cgmm(temp.path(), &["seeds"], &[("CGMM_CLUSTERS", "4")]);
    assert_eq!(stdout(&output).lines().count(), 4);

    // Argument over everything
    let output = run_cgmm(temp.path(), &["seeds", "6"], &[("CGMM_CLUSTERS", "4")]);
    assert_eq!(stdout(&output).lines().count(), 6);
}

// =============================================================================
// Config Command Tests
// =============================================================================

#[test]
fn test_config_set_get_reset() {
    let temp = TempDir::new().unwrap();

    let output = run_cgmm(temp.path(), &["config", "set", "backend", "cpu"], &[]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(temp.path().join("config/config.json").exists());

    let output = run_cgmm(temp.path(), &["config", "get", "backend"], &[]);
    assert_eq!(stdout(&output).trim(), "cpu");

    let output = run_cgmm(temp.path(), &["config", "reset"], &[]);
    assert!(output.status.success());
    let output = run_cgmm(temp.path(), &["config", "get", "backend"], &[]);
    assert_eq!(stdout(&output).trim(), "gpu");
}

#[test]
fn test_config_rejects_invalid_values() {
    let temp = TempDir::new().unwrap();

    let output = run_cgmm(temp.path(), &["config", "set", "clusters", "99"], &[]);
    assert!(!output.status.success());
    assert!(!temp.path().join("config/config.json").exists());

    let output = run_cgmm(temp.path(), &["config", "set", "colour", "srgb"], &[]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Unknown config key"));
}

#[test]
fn test_config_path_and_show() {
    let temp = TempDir::new().unwrap();

    let output = run_cgmm(temp.path(), &["config", "path"], &[]);
    assert!(output.status.success());
    let path = stdout(&output);
    assert!(path.trim().ends_with("config.json"));
    assert!(path.contains("config"));

    let output = run_cgmm(temp.path(), &["config", "show"], &[]);
    assert!(output.status.success());
    let shown = stdout(&output);
    assert!(shown.contains("Clusters:"));
    assert!(shown.contains("srgb"));
}
