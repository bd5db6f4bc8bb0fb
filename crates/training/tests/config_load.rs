use std::fs;
use std::path::PathBuf;

use training::ProjectPaths;

#[test]
fn loads_paths_and_expands_variables() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("voicemap.toml");
    std::env::set_var("VOICEMAP_CONFIG_TEST_DATA", "/mnt/corpora");
    fs::write(
        &path,
        "path = \"runs/speaker\"\ndata_path = \"${VOICEMAP_CONFIG_TEST_DATA}/audio\"\n",
    )
    .expect("write config");

    let paths = ProjectPaths::from_path(&path).expect("load config");
    assert_eq!(paths.path, PathBuf::from("runs/speaker"));
    assert_eq!(paths.data_path, PathBuf::from("/mnt/corpora/audio"));
}

#[test]
fn missing_keys_fall_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("partial.toml");
    fs::write(&path, "path = \"out\"\n").expect("write config");

    let paths = ProjectPaths::from_path(&path).expect("load config");
    assert_eq!(paths.path, PathBuf::from("out"));
    assert_eq!(paths.data_path, PathBuf::from("data"));
}

#[test]
fn explicit_config_must_exist() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(ProjectPaths::load(Some(&dir.path().join("absent.toml"))).is_err());
}

#[test]
fn setup_dirs_creates_models_and_logs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ProjectPaths {
        path: dir.path().join("run"),
        data_path: dir.path().join("data"),
    };
    paths.setup_dirs().expect("setup dirs");
    assert!(paths.models_dir().is_dir());
    assert!(paths.logs_dir().is_dir());
    // idempotent
    paths.setup_dirs().expect("setup dirs twice");
}
