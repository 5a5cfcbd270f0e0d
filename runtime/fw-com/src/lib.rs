//! Firmware Communication - Shared-memory queues between host and IPU firmware
//!
//! # Purpose
//! Carries fixed-layout command records from the host to the process-system
//! firmware and event records back, through a pair of single-producer /
//! single-consumer rings placed in memory both sides can see.
//!
//! # Integration Points
//! - Depends on: a [`Doorbell`] that wakes the firmware
//! - Provides to: the built-in command backend of `ipu-psys`
//! - Shared memory: [`queue_pair`] creates the two rings of one device
//!
//! # Architecture
//! Lock-free ring buffers using acquire/release atomics. Each ring is split
//! into one owned producer and one owned consumer, so a ring never sees a
//! second writer or reader. [`FwCom`] keeps its two ends behind spinlocks
//! for callers on several threads. The only
//! cross-domain step is the doorbell, which is fire-and-forget: a send rings
//! it after every enqueue, and a send that finds the command ring full rings
//! it, waits a bounded number of spins for the firmware to drain, and retries
//! once before reporting [`ComError::QueueFull`].
//!
//! # Testing Strategy
//! - Unit tests: ring wraparound, full/empty detection, retry behaviour
//! - Hardware sim tests: [`FirmwarePort`] plays the firmware side

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod record;
mod ring;

pub use record::{EventStatus, PsysCommand, PsysEvent, ProcessGroupCommand};
pub use ring::{Consumer, Producer, SharedRing};

use alloc::boxed::Box;

use spin::Mutex;
use thiserror::Error;

/// Queue error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ComError {
    #[error("Queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Queue empty")]
    QueueEmpty,
}

pub type Result<T> = core::result::Result<T, ComError>;

/// Slots in the host-to-firmware command ring
pub const COMMAND_QUEUE_SIZE: usize = 16;

/// Slots in the firmware-to-host event ring
pub const EVENT_QUEUE_SIZE: usize = 32;

/// Spins to wait for the firmware after ringing on a full queue
pub const DEFAULT_RETRY_SPINS: u32 = 10_000;

/// Wakes the firmware after the host has queued work
///
/// Implementations write a mailbox or interrupt register. Ringing must not
/// block.
pub trait Doorbell: Send + Sync {
    fn ring(&self);
}

/// Host ends of one device's queue pair
pub struct HostPort {
    commands: Producer<PsysCommand, COMMAND_QUEUE_SIZE>,
    events: Consumer<PsysEvent, EVENT_QUEUE_SIZE>,
}

/// Create the command and event rings for one device
///
/// Each ring end exists once: the host holds the command producer and the
/// event consumer, the firmware the other two.
pub fn queue_pair() -> (HostPort, FirmwarePort) {
    let (command_tx, command_rx) = SharedRing::new().split();
    let (event_tx, event_rx) = SharedRing::new().split();
    (
        HostPort {
            commands: command_tx,
            events: event_rx,
        },
        FirmwarePort {
            commands: command_rx,
            events: event_tx,
        },
    )
}

/// Host end of the queue pair
///
/// Sends and receives may come from any thread; each ring end sits behind
/// its own lock so the rings only ever see one producer and one consumer.
pub struct FwCom {
    commands: Mutex<Producer<PsysCommand, COMMAND_QUEUE_SIZE>>,
    events: Mutex<Consumer<PsysEvent, EVENT_QUEUE_SIZE>>,
    doorbell: Box<dyn Doorbell>,
    retry_spins: u32,
}

impl FwCom {
    pub fn new(host: HostPort, doorbell: Box<dyn Doorbell>) -> Self {
        Self {
            commands: Mutex::new(host.commands),
            events: Mutex::new(host.events),
            doorbell,
            retry_spins: DEFAULT_RETRY_SPINS,
        }
    }

    /// Override how long a send waits on a full queue before its one retry
    pub fn with_retry_spins(mut self, spins: u32) -> Self {
        self.retry_spins = spins;
        self
    }

    /// Queue a command and ring the doorbell
    ///
    /// # Errors
    /// Returns `ComError::QueueFull` if the ring is still full after the
    /// doorbell has been rung and the bounded wait has elapsed.
    pub fn send(&self, command: PsysCommand) -> Result<()> {
        let mut ring = self.commands.lock();
        if let Err(ComError::QueueFull { .. }) = ring.push(command) {
            log::warn!("command queue full, ringing doorbell before retry");
            self.doorbell.ring();
            for _ in 0..self.retry_spins {
                if !ring.is_full() {
                    break;
                }
                core::hint::spin_loop();
            }
            ring.push(command)?;
        }

        log::debug!(
            "sent command {} for context {:#x}",
            command.command,
            command.context_handle
        );
        self.doorbell.ring();
        Ok(())
    }

    /// Take the next firmware event, if any
    pub fn recv_event(&self) -> Option<PsysEvent> {
        self.events.lock().pop().ok()
    }

    /// Commands the firmware has not consumed yet
    pub fn pending_commands(&self) -> usize {
        self.commands.lock().len()
    }
}

/// Firmware end of the queue pair
///
/// Used by firmware simulators and host-side tests to consume commands and
/// post events.
pub struct FirmwarePort {
    commands: Consumer<PsysCommand, COMMAND_QUEUE_SIZE>,
    events: Producer<PsysEvent, EVENT_QUEUE_SIZE>,
}

impl FirmwarePort {
    pub fn next_command(&mut self) -> Option<PsysCommand> {
        self.commands.pop().ok()
    }

    pub fn post_event(&mut self, event: PsysEvent) -> Result<()> {
        self.events.push(event)
    }
}
