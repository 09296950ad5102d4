//! Error types for the verigate binary and server surface
//!
//! Component-level failures (token verification, store access, key fetches)
//! have their own enums next to the component. This type covers startup,
//! configuration and I/O faults that never reach `authenticate()`.

use std::io;

use thiserror::Error;

/// Result type alias for verigate
pub type Result<T> = std::result::Result<T, Error>;

/// Verigate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token issuance error
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for the CLI.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 78, // EX_CONFIG
            Self::Io(_) => 74,     // EX_IOERR
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(Error::Config("bad".to_string()).exit_code(), 78);
        assert_eq!(Error::Io(io::Error::other("disk")).exit_code(), 74);
        assert_eq!(Error::Internal("boom".to_string()).exit_code(), 1);
    }
}
