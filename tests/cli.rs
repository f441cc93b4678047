use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

const DESIGN: &str = "a,dose\nlow,1\nhigh,1\nlow,2\nhigh,2\nlow,3\nhigh,3\nlow,4\nhigh,4\nlow,5\nhigh,5\nlow,6\nhigh,6\n";

fn write_design(dir: &Path) -> String {
    let path = dir.join("design.csv");
    fs::write(&path, DESIGN).expect("write design");
    path.to_str().expect("path str").to_string()
}

fn survpower(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_survpower"))
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("run survpower cli")
}

#[test]
fn writes_a_power_table_and_replicate_matrices() {
    let tmp = tempdir().expect("temporary directory");
    let design = write_design(tmp.path());
    let output = survpower(
        tmp.path(),
        &[
            &design,
            "--model",
            "~ a + dose",
            "--distribution",
            "exponential",
            "--censor-point",
            "20",
            "--nsim",
            "30",
            "--seed",
            "4",
            "--detailed",
            "--no-progress",
            "--output",
            "power.csv",
            "--estimates-out",
            "estimates.csv",
            "--pvalues-out",
            "pvalues.csv",
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let table = fs::read_to_string(tmp.path().join("power.csv")).expect("power table");
    let mut lines = table.lines();
    assert_eq!(
        lines.next(),
        Some("parameter,type,power,anticoef,alpha,distribution,trials,nsim")
    );
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].starts_with("(Intercept),parameter.power.mc,"));
    assert!(rows.iter().all(|row| row.ends_with(",0.05,exponential,12,30")));

    let estimates = fs::read_to_string(tmp.path().join("estimates.csv")).expect("estimates");
    assert_eq!(estimates.lines().next(), Some("(Intercept),a1,dose"));
    assert_eq!(estimates.lines().count(), 31);
    assert!(tmp.path().join("pvalues.csv").exists());
}

#[test]
fn prints_to_stdout_and_honours_a_config_file() {
    let tmp = tempdir().expect("temporary directory");
    let design = write_design(tmp.path());
    fs::write(
        tmp.path().join("power.toml"),
        "nsim = 15\nseed = 9\nanticoef = [0.0, 1.0]\n",
    )
    .expect("write config");
    let output = survpower(
        tmp.path(),
        &[&design, "--model", "~ a", "--config", "power.toml", "--no-progress"],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    let rows: Vec<&str> = stdout.lines().collect();
    assert_eq!(rows[0], "parameter,type,power");
    assert_eq!(rows.len(), 3);
    assert!(rows[2].starts_with("a1,parameter.power.mc,"));
}

#[test]
fn saved_options_reload_with_flag_values() {
    let tmp = tempdir().expect("temporary directory");
    let design = write_design(tmp.path());
    let output = survpower(
        tmp.path(),
        &[
            &design,
            "--model",
            "~ a",
            "--nsim",
            "5",
            "--effect-size",
            "1,4",
            "--distribution",
            "lognormal",
            "--save-config",
            "saved.toml",
            "--no-progress",
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let saved = fs::read_to_string(tmp.path().join("saved.toml")).expect("saved config");
    assert!(saved.contains("nsim = 5"));
    assert!(saved.contains("distribution = \"lognormal\""));
}

#[test]
fn deprecated_flags_fail_with_the_replacement_name() {
    let tmp = tempdir().expect("temporary directory");
    let design = write_design(tmp.path());
    let output = survpower(tmp.path(), &[&design, "--delta", "2", "--no-progress"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("effect_size"), "stderr: {stderr}");
}

#[test]
fn coefficient_count_mismatch_exits_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let design = write_design(tmp.path());
    let output = survpower(
        tmp.path(),
        &[&design, "--model", "~ a", "--anticoef", "1,2,3", "--no-progress"],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("expected 2"), "stderr: {stderr}");
    assert!(stderr.contains("got 3"), "stderr: {stderr}");
}
