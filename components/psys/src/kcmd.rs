//! Kernel command: host-side tracking of one submitted process group

use bitflags::bitflags;
use psys_resources::{ResourceAllocationSet, ResourceError};
use thiserror::Error;

use crate::error::{AbiError, ErrorClass};
use crate::manifest::ProgramGroupManifest;
use crate::pg::ProcessGroup;

/// Identifier for a kcmd, written into its process group's token field
///
/// Zero is reserved: the firmware uses it for device-wide events.
pub type KcmdToken = u64;

/// Lifecycle of a kcmd
///
/// ```text
/// New -> StartPrepared -> Started -> RunPrepared -> Running -> Complete
///   \__________________________________/^
/// ```
///
/// A kcmd skips the started stage when the running pool has room. Abort and
/// the watchdog move any non-terminal state straight to `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KcmdState {
    New,
    StartPrepared,
    Started,
    RunPrepared,
    Running,
    Complete,
}

bitflags! {
    /// Bookkeeping bits on a kcmd
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KcmdFlags: u32 {
        /// Terminals bound and token set
        const CONFIGURED = 1 << 0;
        const WATCHDOG_ARMED = 1 << 1;
        const ABORTED = 1 << 2;
        const TIMED_OUT = 1 << 3;
        /// Resources returned to their pool
        const RELEASED = 1 << 4;
    }
}

/// Scheduling priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Why a kcmd completed unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KcmdError {
    #[error("Backend rejected the process group: {0}")]
    BackendRejected(AbiError),

    #[error("Watchdog expired")]
    Timeout,

    #[error("Aborted")]
    Aborted,

    #[error("Firmware reported status {status}")]
    Firmware { status: u16 },

    #[error("Resource allocation failed: {0}")]
    Resources(ResourceError),

    #[error("Device reset")]
    Reset,

    #[error("Process group cannot be scheduled")]
    Unschedulable,
}

impl KcmdError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KcmdError::Timeout => ErrorClass::Timeout,
            KcmdError::Resources(err) if err.is_exhaustion() => ErrorClass::ResourceExhausted,
            KcmdError::Resources(_) | KcmdError::Unschedulable => ErrorClass::Structural,
            _ => ErrorClass::BackendRejected,
        }
    }
}

/// Completion notice for one kcmd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcmdEvent {
    pub token: KcmdToken,
    pub user_token: u64,
    pub issue_id: u64,
    pub error: Option<KcmdError>,
}

/// Deadline for a kcmd in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watchdog {
    deadline_ms: Option<u64>,
}

impl Watchdog {
    pub fn arm(&mut self, now_ms: u64, timeout_ms: u64) {
        self.deadline_ms = Some(now_ms.saturating_add(timeout_ms));
    }

    pub fn disarm(&mut self) {
        self.deadline_ms = None;
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        self.deadline_ms.is_some_and(|deadline| now_ms >= deadline)
    }
}

/// One submitted process group and everything tracked about it
#[derive(Debug)]
pub struct KernelCommand {
    pub(crate) token: KcmdToken,
    pub(crate) state: KcmdState,
    pub(crate) flags: KcmdFlags,
    pub(crate) pg: ProcessGroup,
    pub(crate) manifest: ProgramGroupManifest,
    pub(crate) resources: ResourceAllocationSet,
    pub(crate) priority: Priority,
    pub(crate) issue_id: u64,
    pub(crate) user_token: u64,
    pub(crate) watchdog: Watchdog,
    pub(crate) error: Option<KcmdError>,
}

impl KernelCommand {
    pub(crate) fn new(
        token: KcmdToken,
        pg: ProcessGroup,
        manifest: ProgramGroupManifest,
        priority: Priority,
        issue_id: u64,
        user_token: u64,
    ) -> Self {
        Self {
            token,
            state: KcmdState::New,
            flags: KcmdFlags::empty(),
            pg,
            manifest,
            resources: ResourceAllocationSet::new(),
            priority,
            issue_id,
            user_token,
            watchdog: Watchdog::default(),
            error: None,
        }
    }

    pub fn token(&self) -> KcmdToken {
        self.token
    }

    pub fn state(&self) -> KcmdState {
        self.state
    }

    pub fn flags(&self) -> KcmdFlags {
        self.flags
    }

    pub fn process_group(&self) -> &ProcessGroup {
        &self.pg
    }

    /// Hand back the process group buffer, including any firmware updates
    pub fn into_process_group(self) -> ProcessGroup {
        self.pg
    }

    pub fn resources(&self) -> &ResourceAllocationSet {
        &self.resources
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn issue_id(&self) -> u64 {
        self.issue_id
    }

    pub fn user_token(&self) -> u64 {
        self.user_token
    }

    pub fn error(&self) -> Option<KcmdError> {
        self.error
    }

    pub fn is_complete(&self) -> bool {
        self.state == KcmdState::Complete
    }

    pub(crate) fn event(&self) -> KcmdEvent {
        KcmdEvent {
            token: self.token,
            user_token: self.user_token,
            issue_id: self.issue_id,
            error: self.error,
        }
    }
}
