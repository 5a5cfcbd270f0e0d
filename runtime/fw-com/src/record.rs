//! Fixed-layout records exchanged with the firmware

use static_assertions::const_assert_eq;

/// Process-group commands understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcessGroupCommand {
    Nop = 0,
    Submit = 1,
    Attach = 2,
    Detach = 3,
    Start = 4,
    Disown = 5,
    Run = 6,
    Stop = 7,
    Suspend = 8,
    Resume = 9,
    Abort = 10,
    Reset = 11,
}

/// Host-to-firmware command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PsysCommand {
    pub command: u16,
    pub msg: u16,
    /// Device address of the process group the command targets
    pub context_handle: u32,
}

const_assert_eq!(core::mem::size_of::<PsysCommand>(), 8);

impl PsysCommand {
    pub fn new(command: ProcessGroupCommand, context_handle: u32) -> Self {
        Self {
            command: command as u16,
            msg: 0,
            context_handle,
        }
    }
}

/// Completion status carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Whole process group done
    Success,
    /// One fragment done; the job is complete from the host's view
    FragmentComplete,
    /// Any firmware-reported failure
    Error(u16),
}

impl EventStatus {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => EventStatus::Success,
            1 => EventStatus::FragmentComplete,
            other => EventStatus::Error(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            EventStatus::Success => 0,
            EventStatus::FragmentComplete => 1,
            EventStatus::Error(raw) => raw,
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, EventStatus::Error(_))
    }
}

/// Firmware-to-host event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PsysEvent {
    pub status: u16,
    pub command: u16,
    pub process_group: u32,
    /// Token the host attached to the process group
    pub token: u64,
}

const_assert_eq!(core::mem::size_of::<PsysEvent>(), 16);

impl PsysEvent {
    pub fn new(status: EventStatus, token: u64) -> Self {
        Self {
            status: status.raw(),
            command: 0,
            process_group: 0,
            token,
        }
    }

    pub fn status(&self) -> EventStatus {
        EventStatus::from_raw(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(EventStatus::from_raw(0).is_success());
        assert!(EventStatus::from_raw(1).is_success());
        assert_eq!(EventStatus::from_raw(7), EventStatus::Error(7));
        assert!(!EventStatus::Error(7).is_success());
    }
}
