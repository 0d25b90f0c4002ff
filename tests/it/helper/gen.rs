//! Helpers for generating test values.

use std::{path::PathBuf, time::Duration};

use commit_scanner::debug;
use commit_scanner::ext::secrecy::ComparableSecretString;
use humantime::parse_duration;

#[track_caller]
pub(crate) fn debug_root(val: &str) -> debug::Root {
    debug::Root::new(PathBuf::from(String::from(val)))
}

#[track_caller]
pub(crate) fn path_buf(val: &str) -> PathBuf {
    PathBuf::from(String::from(val))
}

#[track_caller]
pub(crate) fn secret(val: &str) -> ComparableSecretString {
    ComparableSecretString::from(String::from(val))
}

#[track_caller]
pub(crate) fn duration(val: &str) -> Duration {
    parse_duration(val).expect("must have parsed test duration")
}
