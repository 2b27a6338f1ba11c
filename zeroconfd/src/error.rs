use thiserror::Error;
use shared::txt::{TxtDecodeError, TxtEncodeError};
use crate::engine::ErrorCode;

pub type Result<T> = std::result::Result<T, ZeroconfError>;

#[derive(Debug, Error)]
pub enum ZeroconfError {
    /// The request can never succeed as given
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// An engine call failed when issued
    #[error("Engine rejected {operation}: {code}")]
    Engine { operation: &'static str, code: ErrorCode },

    /// An engine call failed after it was issued
    #[error("{operation} failed: {code}")]
    Protocol { operation: &'static str, code: ErrorCode },

    #[error("Engine handle for {0} has no readiness descriptor")]
    Descriptor(&'static str),

    #[error("Malformed TXT record: {0}")]
    Decode(#[from] TxtDecodeError),

    #[error("Cannot encode TXT records: {0}")]
    TxtEncode(#[from] TxtEncodeError),

    #[error("Registration of '{name}' failed after {attempts} attempts")]
    RegistrationFailed { name: String, attempts: u32 },
}

impl ZeroconfError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, ZeroconfError::Configuration(_))
    }
}
