//! Error taxonomy for the backend.
//!
//! Transpile and link failures are contained (the affected shader or program
//! is left unusable), lookup failures degrade to "not found", and device
//! failures are handed back to the caller untouched.

use thiserror::Error;

/// Errors reported by the device seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device refused to create or allocate an object.
    #[error("device allocation failed: {0}")]
    Allocation(String),
    /// A pipeline or binding layout could not be built.
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),
    /// The shader compiler rejected a stage.
    #[error("shader compilation failed: {0}")]
    Compile(String),
    /// A fence did not signal within the configured bound.
    #[error("fence wait timed out after {0} ns")]
    FenceTimeout(u64),
    /// The device is gone (driver reset, removal, or queue failure).
    #[error("device lost: {0}")]
    Lost(String),
}

/// Errors that can occur in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// Malformed or unsupported shader source. The registry slot stays empty.
    #[error("shader transpile error in {shader}: {message}")]
    ShaderTranspile { shader: String, message: String },
    /// A stage failed to compile or the binding layout could not be built.
    #[error("link error in program {program}: {message}")]
    Link { program: String, message: String },
    /// A uniform, buffer, texture, or program handle does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    /// Unrecoverable device failure. Never retried.
    #[error("fatal device error: {0}")]
    DeviceFatal(#[from] DeviceError),
}

impl RenderError {
    pub(crate) fn transpile(shader: &str, message: impl Into<String>) -> Self {
        RenderError::ShaderTranspile {
            shader: shader.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn link(program: &str, message: impl Into<String>) -> Self {
        RenderError::Link {
            program: program.to_string(),
            message: message.into(),
        }
    }

    /// Whether the session can continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::DeviceFatal(_))
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Errors from applying `set <name> <value>` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown variable {0}")]
    UnknownVariable(String),
    #[error("invalid value \"{value}\" for {name}")]
    InvalidValue { name: String, value: String },
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("usage: set <name> <value>")]
    Usage,
    /// A script line failed.
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub(crate) fn at_line(self, line: usize) -> Self {
        ConfigError::Line {
            line,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_are_fatal() {
        let err: RenderError = DeviceError::FenceTimeout(10).into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_contained_errors_are_not_fatal() {
        assert!(!RenderError::transpile("a.frag", "bad").is_fatal());
        assert!(!RenderError::link("objects", "bad").is_fatal());
        assert!(!RenderError::ResourceNotFound("uniform x".into()).is_fatal());
    }

    #[test]
    fn test_config_error_names_the_line() {
        let err = ConfigError::UnknownVariable("gpu_nonsense".into()).at_line(3);
        assert_eq!(err.to_string(), "line 3: unknown variable gpu_nonsense");
        assert!(std::error::Error::source(&err).is_some());
    }
}
