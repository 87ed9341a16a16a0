//! Error handling for the events subsystem.
//!
//! Recording APIs never propagate [`Error`] to callers; see
//! [`crate::error_recorder::ErrorRecorder`] for how validation failures are
//! surfaced instead. This type exists for the handful of fatal paths (storage
//! I/O, configuration construction) and for tests that want to assert on a
//! concrete value.

use std::fmt::{self, Display};

use backtrace::Backtrace;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The main error type.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub backtrace: Box<Backtrace>,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

// Forward From impls to Error from ErrorKind. Because From is reflexive,
// this impl also takes care of From<ErrorKind>.
impl<T> From<T> for Error
where
    ErrorKind: From<T>,
{
    fn from(item: T) -> Self {
        Error {
            kind: ErrorKind::from(item),
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("invalid server endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("insecure server endpoint outside test mode: {0}")]
    InsecureEndpoint(String),

    #[error("invalid debug view tag: {0}")]
    InvalidDebugViewTag(String),

    #[error("invalid source tags: {0}")]
    InvalidSourceTags(String),

    #[error("{0}")]
    General(String),
}

/// The kinds of recoverable validation failures this subsystem records
/// against a metric's error counter, rather than raising to the caller.
///
/// `InvalidLabel` and `InvalidState` are declared for parity with the wider
/// error taxonomy shared across all Glean metric types; the events subsystem
/// never raises them itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    InvalidValue,
    InvalidType,
    InvalidOverflow,
    InvalidLabel,
    InvalidState,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorType::InvalidValue => "invalid_value",
            ErrorType::InvalidType => "invalid_type",
            ErrorType::InvalidOverflow => "invalid_overflow",
            ErrorType::InvalidLabel => "invalid_label",
            ErrorType::InvalidState => "invalid_state",
        };
        f.write_str(s)
    }
}
