//! Code-signature records.
//!
//! Verification semantics live behind the [`SignatureChecker`] seam; the
//! engine only cares about the resulting record, its cache keying and the
//! TOCTOU bracket around its computation.

use std::io;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CsigStatus {
    /// Signature present and valid.
    Good,
    /// No signature on the image.
    Unsigned,
    /// Signature present but invalid.
    Bad,
    /// Verification could not complete.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Codesign {
    pub status: CsigStatus,
    pub ident: Option<String>,
    pub teamid: Option<String>,
}

impl Codesign {
    pub fn unsigned() -> Self {
        Self {
            status: CsigStatus::Unsigned,
            ident: None,
            teamid: None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.status == CsigStatus::Good
    }
}

#[derive(Error, Debug)]
pub enum CsigError {
    #[error("signature check failed for {path}")]
    Check {
        #[source]
        source: io::Error,
        path: String,
    },
}

impl CsigError {
    pub fn is_oom(&self) -> bool {
        match self {
            CsigError::Check { source, .. } => source.kind() == io::ErrorKind::OutOfMemory,
        }
    }
}

/// Computes the signature record for an image path.
///
/// Can be very slow; the acquisition pipeline only invokes it off the kernel
/// callback path unless configured otherwise.
pub trait SignatureChecker: Send + Sync {
    fn check(&self, path: &str) -> Result<Codesign, CsigError>;
}

/// Checker used when no signature backend is wired in: every image is
/// reported unsigned.
pub struct UnsignedChecker;

impl SignatureChecker for UnsignedChecker {
    fn check(&self, _path: &str) -> Result<Codesign, CsigError> {
        Ok(Codesign::unsigned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_checker_reports_unsigned() {
        let cs = UnsignedChecker.check("/bin/ls").unwrap();
        assert_eq!(cs.status, CsigStatus::Unsigned);
        assert!(!cs.is_good());
    }
}
