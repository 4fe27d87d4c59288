use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::state::Phase;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_CONFIGURED: i32 = 2;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("failed to fetch {location}")]
    Network {
        location: String,
        #[source]
        source: BoxError,
    },

    #[error("malformed manifest at {location}")]
    Parse {
        location: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to write {}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load native library {name}")]
    Link {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("entry point {entry} could not be resolved")]
    Resolution { entry: String },

    #[error("manifest declares neither a launch command nor an entry point")]
    Configuration,

    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bootstrap worker stopped unexpectedly: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

impl BootstrapError {
    pub fn network(location: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Network {
            location: location.into(),
            source: source.into(),
        }
    }

    pub fn parse(location: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Parse {
            location: location.into(),
            source: source.into(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Network and parse failures fall back to the last known-good state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Parse { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration => EXIT_NOT_CONFIGURED,
            _ => EXIT_FAILURE,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Network { .. } => "Update check failed",
            Self::Parse { .. } => "Invalid application manifest",
            Self::Filesystem { .. } => "Could not write application files",
            Self::Link { .. } => "Could not load native library",
            Self::Resolution { .. } => "Application entry point not found",
            Self::Configuration => "Application launch is not configured",
            Self::Spawn { .. } => "Could not start application",
            Self::Worker(_) => "Bootstrap crashed",
        }
    }
}

/// Everything the presentation layer needs to show a fatal error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureReport {
    pub title: String,
    pub phase: Phase,
    pub causes: Vec<String>,
}

impl FailureReport {
    pub fn new(err: &BootstrapError, phase: Phase) -> Self {
        let mut causes = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            title: err.title().to_owned(),
            phase,
            causes,
        }
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (phase {})", self.title, self.phase)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}
