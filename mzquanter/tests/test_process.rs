use std::{env, error::Error, fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

use mzquant::Results;

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzquanter")?;

    cmd.arg("not_real.mzML").args(["-m", "DDSPDLPK"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
    Ok(())
}

#[test]
fn test_malformed_time_range() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzquanter")?;

    cmd.arg("not_real.mzML").args(["-m", "DDSPDLPK"]).args(["-r a-z"]);
    cmd.assert().failure().stderr(predicate::str::contains(
        "Failed to parse time range end invalid float literal",
    ));

    let mut cmd = Command::cargo_bin("mzquanter")?;

    cmd.arg("not_real.mzML").args(["-m", "DDSPDLPK"]).args(["-r", "a-"]);
    cmd.assert().failure().stderr(predicate::str::contains(
        "Failed to parse time range start invalid float literal",
    ));

    Ok(())
}

#[test]
fn test_malformed_label() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzquanter")?;

    cmd.arg("./tests/data/bsa_1165.mgf")
        .args(["-m", "DDSPDLPK", "--metabolic-label", "15N"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Expected ISOTOPE:LEVEL"));
    Ok(())
}

#[test]
fn test_no_molecules() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzquanter")?;

    cmd.arg("./tests/data/bsa_1165.mgf");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("NoMoleculesError"));
    Ok(())
}

#[test]
fn test_run_bsa() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzquanter")?;
    cmd.env("RUST_LOG", "info");
    cmd.arg("./tests/data/bsa_1165.mgf")
        .args(["-m", "DDSPDLPK", "-z", "2", "--ms-level", "0", "-o", "-"]);
    let result = cmd.assert().success();
    result
        .stdout(predicate::str::contains("mScore"))
        .stdout(predicate::str::contains("C(37)H(59)N(9)O(16),DDSPDLPK,2"))
        .stdout(predicate::str::contains("bsa_1165.mgf"))
        .stderr(predicate::str::contains("Spectra: 2"))
        .stderr(predicate::str::contains("Matches: 2"));
    Ok(())
}

#[test]
fn test_run_subset() -> Result<(), Box<dyn Error>> {
    let outdir = env::temp_dir().join("mzquanter_test_run_subset");
    fs::create_dir_all(&outdir)?;
    let csv_path = outdir.join("matches.csv");
    let json_path = outdir.join("results.json");

    let mut cmd = Command::cargo_bin("mzquanter")?;
    cmd.env("RUST_LOG", "info");
    cmd.arg("./tests/data/bsa_1165.mgf")
        .args(["-m", "DDSPDLPK", "--ms-level", "0", "-r", "29.05-29.15"])
        .arg("-o")
        .arg(&csv_path)
        .arg("--results-json")
        .arg(&json_path);
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Spectra: 1"));

    let table = fs::read_to_string(&csv_path)?;
    assert_eq!(table.lines().count(), 2, "{table}");

    let results = Results::load_json(&json_path)?;
    assert_eq!(results.len(), 1);
    assert_eq!(results.num_matches(), 1);
    let (key, entry) = results.iter().next().ok_or("no results")?;
    assert_eq!(key.file_name, "bsa_1165.mgf");
    assert_eq!(key.charge, 2);
    assert!((entry.data[0].rt - 29.1).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_run_compressed_output() -> Result<(), Box<dyn Error>> {
    use std::io::Read;

    let outdir = env::temp_dir().join("mzquanter_test_run_compressed_output");
    fs::create_dir_all(&outdir)?;
    let csv_path = outdir.join("matches.csv.gz");

    let mut cmd = Command::cargo_bin("mzquanter")?;
    cmd.arg("./tests/data/bsa_1165.mgf")
        .args(["-m", "DDSPDLPK", "--ms-level", "0", "-t", "1"])
        .arg("-o")
        .arg(&csv_path);
    cmd.assert().success();

    let mut table = String::new();
    flate2::read::GzDecoder::new(fs::File::open(&csv_path)?).read_to_string(&mut table)?;
    assert_eq!(table.lines().count(), 3, "{table}");
    assert!(table.starts_with("formula,molecule,charge"));
    Ok(())
}

#[test]
fn test_run_mztab_from_evidence() -> Result<(), Box<dyn Error>> {
    let outdir = env::temp_dir().join("mzquanter_test_run_mztab_from_evidence");
    fs::create_dir_all(&outdir)?;
    let mztab_path = outdir.join("results.mztab");

    let mut cmd = Command::cargo_bin("mzquanter")?;
    cmd.arg("./tests/data/bsa_1165.mgf")
        .args(["--evidence-file", "./tests/data/bsa_evidence.csv"])
        .args(["--ms-level", "0", "-o", "-"])
        .arg("--mztab-file")
        .arg(&mztab_path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("C(37)H(59)N(9)O(16),DDSPDLPK,2"))
        .stdout(predicate::str::contains("P02769"));

    let table = fs::read_to_string(&mztab_path)?;
    let lines: Vec<&str> = table.lines().collect();
    assert!(lines.contains(&"MTD\tms_run[1]-location\tbsa_1165.mgf"), "{table}");
    assert!(lines.contains(&"MTD\tassay[1]-ms_run_ref\tms_run[1]"), "{table}");
    let peptides: Vec<&&str> = lines.iter().filter(|l| l.starts_with("PEP\t")).collect();
    assert_eq!(peptides.len(), 1, "{table}");
    let fields: Vec<&str> = peptides[0].split('\t').collect();
    assert_eq!(fields[1], "DDSPDLPK");
    assert_eq!(fields[3], "null");
    assert_eq!(fields[5], "1746.00|1752.00");
    assert_eq!(fields[6], "2");
    let rt: f64 = fields[4].parse()?;
    assert!((rt - 29.2).abs() < 1e-6, "{rt}");
    let abundance: f64 = fields[8].parse()?;
    assert!(abundance > 0.0);
    Ok(())
}
