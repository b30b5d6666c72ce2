use std::fmt;

/// Main error type for the kingfisher transport layer
#[derive(Debug)]
pub enum KingfisherError {
    /// Configuration errors: bad knob values, bad addresses
    Config(String),

    /// Transport layer errors: bind/send/listen failures, address kind mismatches
    Transport(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Transport-mapping registry errors
    Registry(String),
}

impl fmt::Display for KingfisherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KingfisherError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KingfisherError::Transport(msg) => write!(f, "Transport error: {}", msg),
            KingfisherError::Io(err) => write!(f, "I/O error: {}", err),
            KingfisherError::Registry(msg) => write!(f, "Registry error: {}", msg),
        }
    }
}

impl std::error::Error for KingfisherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KingfisherError::Io(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, KingfisherError>;

// Conversions from common error types
impl From<std::io::Error> for KingfisherError {
    fn from(err: std::io::Error) -> Self {
        KingfisherError::Io(err)
    }
}

impl From<std::net::AddrParseError> for KingfisherError {
    fn from(err: std::net::AddrParseError) -> Self {
        KingfisherError::Config(format!("Invalid address: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::KingfisherError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KingfisherError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::KingfisherError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KingfisherError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! registry_error {
    ($msg:expr) => {
        $crate::error::KingfisherError::Registry($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KingfisherError::Registry(format!($fmt, $($arg)*))
    };
}
