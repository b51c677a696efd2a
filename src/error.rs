use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum ChatwireError {
    // Programmer errors: a caller broke a registry precondition
    Invariant(String),

    // Socket errors
    Io(std::io::Error),

    // Identity errors
    AuthError(String),
    AlreadyExists(String),
    NotFound(String),

    // Storage errors
    StorageError(String),

    // Configuration errors
    ConfigError(String),
}

impl ChatwireError {
    /// True for errors that indicate a bug in the caller rather than a runtime condition
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

impl fmt::Display for ChatwireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invariant(msg) => write!(f, "Invariant violation: {}", msg),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            Self::AlreadyExists(what) => write!(f, "Already exists: {}", what),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for ChatwireError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChatwireError {
    fn from(err: std::io::Error) -> Self {
        ChatwireError::Io(err)
    }
}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for ChatwireError {
    fn from(err: PoisonError<T>) -> Self {
        ChatwireError::StorageError(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for chatwire
pub type Result<T> = std::result::Result<T, ChatwireError>;
