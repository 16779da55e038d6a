// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Crate-wide error type.
//!
//! Startup problems (bad configuration, missing privileges) are fatal;
//! sysfs I/O problems are transient and handled at the call site.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid or unsatisfiable configuration: unbound fan/sensor,
    /// unknown curve/sensor reference, curve dependency cycle.
    #[error("configuration error: {0}")]
    Config(String),

    /// The daemon was started by a non-root user.
    #[error("fan control requires root permissions to modify fan speeds")]
    NotRoot,

    /// A sysfs attribute could not be read.
    #[error("failed to read {path}: {source}")]
    SysfsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A sysfs attribute could not be written.
    #[error("failed to write {path}: {source}")]
    SysfsWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A sysfs attribute held something other than the expected integer.
    #[error("unexpected value in {path}: {value:?}")]
    SysfsParse { path: PathBuf, value: String },

    /// A fan did not spin although its duty cycle says it should.
    #[error("fan {0} is stuck")]
    FanStuck(String),

    /// Saving or loading fan characterization data failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}
