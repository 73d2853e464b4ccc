//! Error taxonomy for the binding runtime
//!
//! Design: one flat enum, hand-written `Display`. Binding errors
//! (bad descriptors, wrong ownership) fail loudly at the point of use;
//! native absence is never an error and never reaches this type.

use core::fmt;

/// Result alias used across the crate
pub type Result<T> = core::result::Result<T, Error>;

/// Runtime errors
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed descriptor (generator or hand-written binding bug)
    Descriptor(String),
    /// Managed value does not fit the descriptor it is marshalled with
    Marshal { expected: &'static str, found: String },
    /// Shared library could not be loaded
    Library { name: String, reason: String },
    /// Symbol missing from a loaded library
    Symbol { library: String, symbol: String },
    /// Identity registry invariant violated
    Registry(String),
    /// Managed handler failed during trampoline dispatch (deferred)
    Callback { registration: u64, message: String },
    /// Runtime was stopped or dropped
    Stopped,
    /// Invalid configuration file or value
    Config(String),
    /// A native hook the operation needs was not configured
    MissingHook(&'static str),
}

impl Error {
    pub(crate) fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    pub(crate) fn marshal(expected: &'static str, found: impl fmt::Debug) -> Self {
        Self::Marshal {
            expected,
            found: format!("{:?}", found),
        }
    }

    /// True for errors caused by a malformed descriptor or ownership tag
    pub fn is_specification_error(&self) -> bool {
        matches!(self, Self::Descriptor(_) | Self::Registry(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Descriptor(msg) => write!(f, "Invalid type descriptor: {}", msg),
            Self::Marshal { expected, found } => {
                write!(f, "Cannot marshal {} as {}", found, expected)
            }
            Self::Library { name, reason } => {
                write!(f, "Failed to load library '{}': {}", name, reason)
            }
            Self::Symbol { library, symbol } => {
                write!(f, "Symbol '{}' not found in '{}'", symbol, library)
            }
            Self::Registry(msg) => write!(f, "Identity registry error: {}", msg),
            Self::Callback { registration, message } => {
                write!(f, "Callback {} failed: {}", registration, message)
            }
            Self::Stopped => write!(f, "Runtime is stopped"),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::MissingHook(name) => write!(f, "Native hook '{}' is not configured", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Descriptor(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
