//! Types and functions for parsing & validating CLI arguments.

use std::path::PathBuf;

use clap::Parser;
use derive_new::new;
use error_stack::{Report, ResultExt};
use getset::{CopyGetters, Getters};
use serde::Serialize;

use crate::{
    config::io,
    ext::{
        error_stack::{DescribeContext, ErrorHelper},
        result::WrapOk,
    },
};

/// Errors that are possibly surfaced during validation of config values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The config file was not able to be located.
    #[error("locate config file")]
    ConfigFileLocation,

    /// The DB file was not able to be located.
    #[error("locate database file")]
    DbFileLocation,

    /// The data root directory was not able to be located.
    #[error("locate data root directory")]
    DataRootLocation,
}

/// Arguments accepted by the `run` subcommand.
/// The "Raw" prefix indicates that this is the initial parsed value before any validation.
///
/// # Background
///
/// There is no exported function in `config` that parses these args; instead these are
/// parsed automatically by `clap` since they implement `Parser` and are included in the
/// top-level subcommand configuration sent to `clap`.
///
/// Unlike with the config file, there's not really a concept of these args "failing to parse",
/// as `clap` steps in and shows the user errors in this case. By the time `clap` hands
/// us this structure, it's been successfully parsed.
#[derive(Debug, Clone, Parser, Serialize, new)]
#[command(version, about)]
pub struct RawArgs {
    /// The path to the config file.
    ///
    /// If unset, this tool searches (in order) for `config.yml` or `config.yaml` in
    /// the current working directory, then (on Linux and macOS) `~/.config/commit-scanner/`,
    /// or (on Windows) `%USERPROFILE%\.config\commit-scanner`.
    #[arg(short = 'c', long)]
    config_file_path: Option<String>,

    /// The path to the database file.
    ///
    /// If unset, this tool searches (in order) for `db.sqlite` in
    /// the current working directory, then (on Linux and macOS) `~/.config/commit-scanner/`,
    /// or (on Windows) `%USERPROFILE%\.config\commit-scanner`.
    #[arg(short = 'd', long)]
    database_file_path: Option<String>,

    /// The directory this process stores its working state in: the work
    /// queue, per-backend worktrees, cached config overrides, and exported
    /// CSVs.
    ///
    /// If unset, this tool uses the platform data directory (e.g.
    /// `~/.local/share/commit-scanner` on Linux).
    #[arg(long)]
    data_root: Option<PathBuf>,
}

impl RawArgs {
    /// Validate the raw args provided.
    ///
    /// In practice, if the user provided a path to the db and config file, the validation is
    /// straightforward. If the user did not provide one or both, this function discovers their
    /// location on disk or errors if they are not able to be found.
    pub async fn validate(self) -> Result<Args, Report<Error>> {
        let config_path = if let Some(provided_path) = self.config_file_path {
            ConfigFilePath::from(provided_path).wrap_ok()
        } else {
            ConfigFilePath::discover()
                .await
                .change_context(Error::ConfigFileLocation)
        };

        let database_path = if let Some(provided_path) = self.database_file_path {
            DatabaseFilePath::from(provided_path).wrap_ok()
        } else {
            DatabaseFilePath::discover()
                .await
                .change_context(Error::DbFileLocation)
        };

        let data_root = if let Some(provided_path) = self.data_root {
            DataRootPath::from(provided_path).wrap_ok()
        } else {
            DataRootPath::discover()
                .await
                .change_context(Error::DataRootLocation)
        };

        match (config_path, database_path, data_root) {
            (Ok(config_path), Ok(database_path), Ok(data_root)) => Ok(Args {
                config_path,
                database_path,
                data_root,
            }),
            (config_path, database_path, data_root) => {
                // `error_stack` supports stacking multiple errors together so they can all be
                // reported at the same time; fold whichever of the three failed into one report.
                let mut errors = [config_path.err(), database_path.err(), data_root.err()].into_iter().flatten();
                let mut combined = errors.next().expect("at least one of the three must have failed");
                for error in errors {
                    combined.extend_one(error);
                }
                Err(combined)
            }
        }
    }
}

/// Validated arguments, used by every subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Args {
    /// The path to the config file on disk.
    config_path: ConfigFilePath,

    /// The path to the database file on disk.
    database_path: DatabaseFilePath,

    /// The directory this process stores its working state in.
    data_root: DataRootPath,
}

/// The path to the config file.
///
/// Note that this is validated as being correctly shaped; the file is not guaranteed to exist.
#[derive(Debug, Clone, Eq, PartialEq, Getters, CopyGetters)]
pub struct ConfigFilePath {
    /// The path on disk for the file.
    #[getset(get = "pub")]
    path: PathBuf,

    /// Whether the path was provided by a user.
    #[getset(get_copy = "pub")]
    provided: bool,
}

impl ConfigFilePath {
    /// Discover the location for the config file on disk.
    async fn discover() -> Result<Self, Report<io::Error>> {
        io::find_some(&["config.yml", "config.yaml"])
            .await
            .describe("searches for 'config.yml' or 'config.yaml'")
            .help("consider providing an explicit argument instead")
            .map(|path| Self {
                path,
                provided: false,
            })
    }
}

impl From<String> for ConfigFilePath {
    fn from(value: String) -> Self {
        Self {
            path: PathBuf::from(value),
            provided: true,
        }
    }
}

/// The path to the database file.
///
/// Note that this is validated as being correctly shaped; the file is not guaranteed to exist.
#[derive(Debug, Clone, Eq, PartialEq, Getters, CopyGetters)]
pub struct DatabaseFilePath {
    /// The path on disk for the file.
    #[getset(get = "pub")]
    path: PathBuf,

    /// Whether the path was provided by a user.
    #[getset(get_copy = "pub")]
    provided: bool,
}

impl DatabaseFilePath {
    /// Discover the location for the database file on disk.
    async fn discover() -> Result<Self, Report<io::Error>> {
        io::find("db.sqlite")
            .await
            .describe("searches for 'db.sqlite'")
            .help("consider providing an explicit argument instead")
            .map(|path| Self {
                path,
                provided: false,
            })
    }
}

impl From<String> for DatabaseFilePath {
    fn from(value: String) -> Self {
        Self {
            path: PathBuf::from(value),
            provided: true,
        }
    }
}

/// The directory this process stores its working state in.
///
/// Unlike [`ConfigFilePath`] and [`DatabaseFilePath`], this path is not required to already
/// exist: it is created on demand by the components that use it (the queue, the worktree
/// manager, the exporter).
#[derive(Debug, Clone, Eq, PartialEq, Getters, CopyGetters)]
pub struct DataRootPath {
    /// The path on disk for the directory.
    #[getset(get = "pub")]
    path: PathBuf,

    /// Whether the path was provided by a user.
    #[getset(get_copy = "pub")]
    provided: bool,
}

impl DataRootPath {
    /// Discover the default location for the data root directory.
    async fn discover() -> Result<Self, Report<io::Error>> {
        io::default_data_root()
            .await
            .describe("uses the platform data directory, e.g. '~/.local/share' on Linux")
            .help("consider providing an explicit argument instead")
            .map(|path| Self {
                path,
                provided: false,
            })
    }
}

impl From<PathBuf> for DataRootPath {
    fn from(path: PathBuf) -> Self {
        Self { path, provided: true }
    }
}
