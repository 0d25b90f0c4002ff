use std::path::PathBuf;

use commit_scanner::config::RawArgs;

fn raw_args(config: Option<&str>, db: Option<&str>, data_root: Option<&str>) -> RawArgs {
    RawArgs::new(
        config.map(String::from),
        db.map(String::from),
        data_root.map(PathBuf::from),
    )
}

#[tokio::test]
async fn validates_explicit_args() {
    let tmp = tempfile::tempdir().expect("must create tempdir");
    let config_path = tmp.path().join("config.yml");
    let db_path = tmp.path().join("db.sqlite");

    let raw = raw_args(
        Some(config_path.to_str().expect("path must be utf8")),
        Some(db_path.to_str().expect("path must be utf8")),
        Some(tmp.path().to_str().expect("path must be utf8")),
    );

    let validated = raw.validate().await.expect("args must have passed validation");
    assert_eq!(validated.config_path().path(), &config_path);
    assert_eq!(validated.database_path().path(), &db_path);
    assert_eq!(validated.data_root().path(), tmp.path());
    assert!(validated.config_path().provided());
    assert!(validated.database_path().provided());
    assert!(validated.data_root().provided());
}

#[tokio::test]
async fn explicit_paths_are_not_required_to_exist() {
    // Only discovery (the "unset" path) errors on a missing file; an
    // explicitly-provided path is trusted as-is so the caller gets a clear
    // "file not found" error later, from the component that actually reads
    // it, rather than a generic one here.
    let raw = raw_args(Some("does/not/exist.yml"), Some("also/missing.sqlite"), Some("also/missing/data"));

    let validated = raw.validate().await.expect("explicit paths should validate regardless of existence");
    assert_eq!(validated.config_path().path(), &PathBuf::from("does/not/exist.yml"));
    assert_eq!(validated.database_path().path(), &PathBuf::from("also/missing.sqlite"));
}
