//! Tests for debugging functionality.

use commit_scanner::debug::{ArtifactRetentionCount, Config, Retention};
use proptest::prelude::*;
use test_strategy::proptest;

use crate::helper::{assert_error_stack_snapshot, gen};

#[proptest]
fn validate_artifact_retention_count(
    #[by_ref]
    #[filter(*#input > 0)]
    input: usize,
) {
    match ArtifactRetentionCount::try_from(input) {
        Ok(validated) => prop_assert_eq!(validated, input, "tested input: {:?}", input),
        Err(err) => prop_assert!(false, "unexpected parsing error '{err:#}' for '{input}'"),
    }
}

#[test]
fn validate_artifact_retention_count_min() {
    let input = 0;
    assert_error_stack_snapshot!(
        &input,
        ArtifactRetentionCount::try_from(input).expect_err("must have failed validation")
    )
}

#[test]
fn validate_artifact_retention_count_default() {
    assert_eq!(ArtifactRetentionCount::default(), 7);
}

#[test]
fn run_tracing_sink_errors_when_root_cannot_be_created() {
    let tmp = tempfile::tempdir().expect("must create tempdir");

    // A regular file where the tracing root needs to be a directory: creating
    // the root (and its `trace` subdirectory) must fail.
    let blocked = tmp.path().join("not-a-directory");
    std::fs::write(&blocked, "").expect("must write blocking file");

    let config = Config::new(gen::debug_root(blocked.to_str().expect("path must be utf8")), Retention::new(ArtifactRetentionCount::default()));

    let err = config.run_tracing_sink().expect_err("must have failed to create the tracing root");
    assert_error_stack_snapshot!(&config, err);
}
