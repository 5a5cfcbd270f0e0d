//! Error types for the process-system layer

use ipu_cpd::CpdError;
use psys_fw_com::ComError;
use psys_resources::ResourceError;
use thiserror::Error;

use crate::config::BackendKind;
use crate::kcmd::{KcmdState, KcmdToken};

/// Coarse failure classes callers act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input; never retried
    Structural,
    /// No free cell or channel right now; retry later
    ResourceExhausted,
    /// Firmware refused the operation; the job fails
    BackendRejected,
    /// Bounded wait expired; handled like a rejection
    Timeout,
}

/// Errors reported by a command backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("Firmware rejected {op}")]
    Rejected { op: &'static str },

    #[error("Command queue: {0}")]
    Queue(#[from] ComError),

    #[error("Unknown terminal type {terminal_type:#x}")]
    UnknownTerminalType { terminal_type: u32 },

    #[error("Terminal {index} does not exist")]
    InvalidTerminal { index: usize },

    #[error("{op} timed out")]
    Timeout { op: &'static str },
}

impl AbiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AbiError::Timeout { .. } => ErrorClass::Timeout,
            _ => ErrorClass::BackendRejected,
        }
    }
}

/// Error types for process-system operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PsysError {
    #[error("Firmware image: {0}")]
    Firmware(#[from] CpdError),

    #[error("Resources: {0}")]
    Resource(#[from] ResourceError),

    #[error("Backend: {0}")]
    Backend(#[from] AbiError),

    #[error("Invalid process group: {reason}")]
    InvalidProcessGroup { reason: &'static str },

    #[error("Invalid program group manifest: {reason}")]
    InvalidManifest { reason: &'static str },

    #[error("Program {program_id} missing from manifest")]
    MissingProgram { program_id: u32 },

    #[error("Terminal {index} has no buffer")]
    UnboundTerminal { index: usize },

    #[error("Buffer for terminal {index}, but the group has {count}")]
    TerminalOutOfRange { index: usize, count: usize },

    #[error("Terminal {index} bound twice")]
    DuplicateTerminal { index: usize },

    #[error("Process group has no device address")]
    NoDeviceAddress,

    #[error("Unknown kcmd {token}")]
    UnknownToken { token: KcmdToken },

    #[error("kcmd {token} is in state {state:?}")]
    InvalidState { token: KcmdToken, state: KcmdState },

    #[error("Firmware already loaded")]
    FirmwareLoaded,

    #[error("No {kind:?} backend available")]
    BackendUnavailable { kind: BackendKind },
}

impl PsysError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PsysError::Firmware(CpdError::AllocationFailed { .. }) => ErrorClass::ResourceExhausted,
            PsysError::Resource(err) if err.is_exhaustion() => ErrorClass::ResourceExhausted,
            PsysError::Backend(err) => err.class(),
            _ => ErrorClass::Structural,
        }
    }

    /// True only when the same request may succeed later unchanged
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::ResourceExhausted
    }

    pub(crate) fn is_exhaustion(&self) -> bool {
        matches!(self, PsysError::Resource(err) if err.is_exhaustion())
    }
}

pub type Result<T> = core::result::Result<T, PsysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let exhausted = PsysError::from(ResourceError::NoFreeCell { cell_type: 2 });
        assert_eq!(exhausted.class(), ErrorClass::ResourceExhausted);
        assert!(exhausted.is_retryable());

        let overflow = PsysError::from(ResourceError::CapacityOverflow { capacity: 128 });
        assert_eq!(overflow.class(), ErrorClass::Structural);

        let blob = PsysError::from(CpdError::BadMarker { mark: 0 });
        assert_eq!(blob.class(), ErrorClass::Structural);
        assert!(!blob.is_retryable());

        let rejected = PsysError::from(AbiError::Rejected { op: "disown" });
        assert_eq!(rejected.class(), ErrorClass::BackendRejected);

        let timeout = PsysError::from(AbiError::Timeout { op: "abort" });
        assert_eq!(timeout.class(), ErrorClass::Timeout);
    }
}
