//! The process system: kcmd scheduling over two resource pools
//!
//! A kcmd reserves its cells and channels in one of two pools. The running
//! pool holds what the hardware is executing; the started pool holds
//! reservations for kcmds already handed to the firmware but waiting for
//! running resources to free up. When a running kcmd completes, the oldest
//! started kcmd is promoted with a single all-or-nothing move.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use ipu_cpd::{build_device_table, validate_top_level, DeviceMemory, PackageDirectory};
use psys_fw_com::EventStatus;
use psys_resources::{LockedPool, ResourcePool};
use spin::Mutex;

use crate::abi::{AbiBackend, PsysAbi, TerminalBuffer};
use crate::allocator::allocate_resources;
use crate::config::PsysConfig;
use crate::error::{AbiError, PsysError, Result};
use crate::kcmd::{
    KcmdError, KcmdEvent, KcmdFlags, KcmdState, KcmdToken, KernelCommand, Priority,
};
use crate::manifest::ProgramGroupManifest;
use crate::pg::ProcessGroup;

/// Monotonic millisecond time source for watchdogs
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Everything a client supplies to submit one process group
#[derive(Debug, Clone, Default)]
pub struct KcmdParams {
    pub process_group: Vec<u8>,
    pub pg_manifest: Vec<u8>,
    pub buffers: Vec<TerminalBuffer>,
    /// Address at which the firmware sees the process group
    pub device_address: u32,
    pub priority: Priority,
    pub issue_id: u64,
    pub user_token: u64,
}

enum Queued {
    /// Started, or completed with an error
    Done,
    /// Exhausted; retry when something completes
    Wait,
}

#[derive(Default)]
struct Scheduler {
    kcmds: BTreeMap<KcmdToken, KernelCommand>,
    pending: [VecDeque<KcmdToken>; Priority::COUNT],
    started: VecDeque<KcmdToken>,
    active: usize,
    completed: VecDeque<KcmdEvent>,
}

impl Scheduler {
    fn pop_pending(&mut self) -> Option<(usize, KcmdToken)> {
        self.pending
            .iter_mut()
            .enumerate()
            .find_map(|(priority, queue)| queue.pop_front().map(|token| (priority, token)))
    }

    fn unlink(&mut self, token: KcmdToken) {
        for queue in self.pending.iter_mut() {
            queue.retain(|&t| t != token);
        }
        self.started.retain(|&t| t != token);
    }
}

pub struct Psys {
    config: PsysConfig,
    abi: AbiBackend,
    clock: Box<dyn Clock>,
    started_pool: LockedPool,
    running_pool: LockedPool,
    scheduler: Mutex<Scheduler>,
    next_token: AtomicU64,
    firmware: Mutex<Option<PackageDirectory>>,
    /// Held while draining backend events
    drain: Mutex<()>,
}

impl Psys {
    /// Create the subsystem with empty pools
    ///
    /// # Errors
    /// Invalid resource definitions, or a backend that does not match
    /// `config.backend`.
    pub fn new(config: PsysConfig, abi: AbiBackend, clock: Box<dyn Clock>) -> Result<Self> {
        if abi.kind() != config.backend {
            return Err(PsysError::BackendUnavailable {
                kind: config.backend,
            });
        }
        let pool = ResourcePool::new(&config.resources)?;

        log::info!(
            "psys: {} cells, {} channel kinds, watchdog {} ms",
            config.resources.num_cells(),
            config.resources.num_channels(),
            config.watchdog_timeout_ms
        );

        Ok(Self {
            started_pool: LockedPool::new("started", pool.clone()),
            running_pool: LockedPool::new("running", pool),
            config,
            abi,
            clock,
            scheduler: Mutex::new(Scheduler::default()),
            next_token: AtomicU64::new(1),
            firmware: Mutex::new(None),
            drain: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PsysConfig {
        &self.config
    }

    pub fn backend(&self) -> &AbiBackend {
        &self.abi
    }

    pub fn started_pool(&self) -> &LockedPool {
        &self.started_pool
    }

    pub fn running_pool(&self) -> &LockedPool {
        &self.running_pool
    }

    /// Validate, configure and queue a process group
    ///
    /// The kcmd is started at once if resources allow; otherwise it waits in
    /// its priority queue. Failures after this call returns are reported
    /// through [`Psys::next_event`].
    ///
    /// # Errors
    /// Malformed process group or manifest, a program missing from the
    /// manifest, buffers that do not bind every terminal exactly once, no
    /// device address, or a backend that rejects terminal binding or
    /// submission. Nothing reaches the backend in the structural cases.
    pub fn submit(&self, params: KcmdParams) -> Result<KcmdToken> {
        let mut pg = ProcessGroup::parse(params.process_group.clone())?;
        let manifest = ProgramGroupManifest::parse(&params.pg_manifest)?;

        for index in 0..pg.process_count() {
            if let Some(process) = pg.process(index) {
                if manifest.program(process.program_id).is_none() {
                    return Err(PsysError::MissingProgram {
                        program_id: process.program_id,
                    });
                }
            }
        }
        check_bindings(&pg, &params)?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.abi.set_device_address(&mut pg, params.device_address);
        for buffer in &params.buffers {
            match self.abi.terminal_set(&mut pg, buffer) {
                Ok(()) => {}
                Err(AbiError::UnknownTerminalType { terminal_type }) => {
                    log::debug!(
                        "kcmd {}: skipping terminal {} of unknown type {:#x}",
                        token,
                        buffer.index,
                        terminal_type
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.abi.set_token(&mut pg, token);
        self.abi.pg_submit(&mut pg)?;
        self.abi.pg_dump(&pg, "submit");

        let mut kcmd = KernelCommand::new(
            token,
            pg,
            manifest,
            params.priority,
            params.issue_id,
            params.user_token,
        );
        kcmd.flags |= KcmdFlags::CONFIGURED;

        let mut guard = self.scheduler.lock();
        let s = &mut *guard;
        s.pending[params.priority.index()].push_back(token);
        s.kcmds.insert(token, kcmd);
        log::debug!("kcmd {}: queued at {:?} priority", token, params.priority);

        self.run_next(s);
        Ok(token)
    }

    /// Abort a kcmd in any state
    ///
    /// Returns `false` when the kcmd had already completed; its resources
    /// were released then and nothing happens now.
    pub fn abort(&self, token: KcmdToken) -> Result<bool> {
        let mut guard = self.scheduler.lock();
        let s = &mut *guard;
        let kcmd = s
            .kcmds
            .get_mut(&token)
            .ok_or(PsysError::UnknownToken { token })?;
        if kcmd.is_complete() {
            log::debug!("kcmd {}: abort after completion ignored", token);
            return Ok(false);
        }

        kcmd.flags |= KcmdFlags::ABORTED;
        self.abort_on_firmware(kcmd);
        self.complete(s, token, Some(KcmdError::Aborted));
        self.reschedule(s);
        Ok(true)
    }

    /// Complete a kcmd with the status the firmware reported
    ///
    /// Returns `false` when the kcmd had already completed.
    pub fn on_event(&self, token: KcmdToken, status: EventStatus) -> Result<bool> {
        let mut guard = self.scheduler.lock();
        let s = &mut *guard;
        let kcmd = s.kcmds.get(&token).ok_or(PsysError::UnknownToken { token })?;
        if kcmd.is_complete() {
            log::debug!("kcmd {}: late event ignored", token);
            return Ok(false);
        }

        let error = (!status.is_success()).then_some(KcmdError::Firmware {
            status: status.raw(),
        });
        self.complete(s, token, error);
        self.reschedule(s);
        Ok(true)
    }

    /// Drain the backend's event queue
    ///
    /// Returns the number of events consumed. A zero token means the
    /// firmware reset: every outstanding kcmd is flushed. Concurrent callers
    /// take turns, so each event is handled once and in queue order.
    pub fn handle_events(&self) -> usize {
        let _drain = self.drain.lock();
        let mut handled = 0;
        while let Some(event) = self.abi.rcv_event() {
            handled += 1;
            if event.token == 0 {
                log::error!("psys: firmware reported reset, flushing kcmds");
                self.flush(KcmdError::Reset);
                continue;
            }
            match self.on_event(event.token, event.status()) {
                Ok(_) => {}
                Err(err) => log::warn!("psys: dropping event: {}", err),
            }
        }
        handled
    }

    /// Abort every started or running kcmd whose watchdog has expired
    ///
    /// Returns the number of kcmds timed out.
    pub fn check_watchdogs(&self) -> usize {
        let now = self.clock.now_ms();
        let mut guard = self.scheduler.lock();
        let s = &mut *guard;

        let expired: Vec<KcmdToken> = s
            .kcmds
            .values()
            .filter(|k| matches!(k.state, KcmdState::Started | KcmdState::Running))
            .filter(|k| k.watchdog.expired(now))
            .map(|k| k.token)
            .collect();

        for &token in &expired {
            if let Some(kcmd) = s.kcmds.get_mut(&token) {
                log::error!("kcmd {}: watchdog expired in {:?}", token, kcmd.state);
                kcmd.flags |= KcmdFlags::TIMED_OUT;
                self.abort_on_firmware(kcmd);
            }
            self.complete(s, token, Some(KcmdError::Timeout));
        }
        if !expired.is_empty() {
            self.reschedule(s);
        }
        expired.len()
    }

    /// Complete every outstanding kcmd with `error`
    pub fn flush(&self, error: KcmdError) {
        let mut guard = self.scheduler.lock();
        let s = &mut *guard;
        let outstanding: Vec<KcmdToken> = s
            .kcmds
            .values()
            .filter(|k| !k.is_complete())
            .map(|k| k.token)
            .collect();
        for token in outstanding {
            self.complete(s, token, Some(error));
        }
    }

    /// Next completion, oldest first
    pub fn next_event(&self) -> Option<KcmdEvent> {
        self.scheduler.lock().completed.pop_front()
    }

    /// Take back a completed kcmd
    ///
    /// # Errors
    /// `InvalidState` unless the kcmd is complete.
    pub fn release(&self, token: KcmdToken) -> Result<KernelCommand> {
        let mut s = self.scheduler.lock();
        let state = s
            .kcmds
            .get(&token)
            .ok_or(PsysError::UnknownToken { token })?
            .state;
        if state != KcmdState::Complete {
            return Err(PsysError::InvalidState { token, state });
        }
        s.kcmds
            .remove(&token)
            .ok_or(PsysError::UnknownToken { token })
    }

    pub fn state(&self, token: KcmdToken) -> Option<KcmdState> {
        self.scheduler.lock().kcmds.get(&token).map(|k| k.state)
    }

    /// Kcmds executing on the hardware
    pub fn active_count(&self) -> usize {
        self.scheduler.lock().active
    }

    /// Kcmds handed to the firmware and waiting for running resources
    pub fn started_count(&self) -> usize {
        self.scheduler.lock().started.len()
    }

    /// Kcmds not yet started
    pub fn pending_count(&self) -> usize {
        self.scheduler.lock().pending.iter().map(VecDeque::len).sum()
    }

    /// Validate a firmware package and build its device table
    ///
    /// `src_address` is the device address of `blob` itself; component
    /// entries in the table point into it.
    ///
    /// # Errors
    /// Any structural problem with the blob, a version mismatch, or device
    /// memory exhaustion. Nothing stays allocated on failure.
    pub fn load_firmware(
        &self,
        blob: &[u8],
        src_address: u64,
        memory: &mut dyn DeviceMemory,
    ) -> Result<()> {
        let mut slot = self.firmware.lock();
        if slot.is_some() {
            return Err(PsysError::FirmwareLoaded);
        }

        let image = validate_top_level(blob, self.config.fw_lib_version).map_err(|err| {
            log::error!("psys: firmware rejected: {}", err);
            err
        })?;
        let table = build_device_table(&image, src_address, memory)?;

        log::info!(
            "psys: firmware {:#x} loaded, {} components, table at {:#x}",
            image.fw_version(),
            image.module_data().components().entry_count(),
            table.device_address()
        );
        *slot = Some(table);
        Ok(())
    }

    /// Release the device table; returns `false` if none was loaded
    pub fn unload_firmware(&self, memory: &mut dyn DeviceMemory) -> bool {
        match self.firmware.lock().take() {
            Some(table) => {
                table.release(memory);
                log::info!("psys: firmware unloaded");
                true
            }
            None => false,
        }
    }

    /// Device address of the loaded package directory
    pub fn firmware_address(&self) -> Option<u64> {
        self.firmware.lock().as_ref().map(PackageDirectory::device_address)
    }

    fn abort_on_firmware(&self, kcmd: &mut KernelCommand) {
        if !matches!(kcmd.state, KcmdState::Started | KcmdState::Running) {
            return;
        }
        if let Err(err) = self.abi.pg_abort(&mut kcmd.pg) {
            log::warn!("kcmd {}: backend abort failed: {}", kcmd.token, err);
        }
    }

    fn reschedule(&self, s: &mut Scheduler) {
        self.run_started(s);
        self.run_next(s);
    }

    fn run_next(&self, s: &mut Scheduler) {
        loop {
            if !self.config.enable_concurrency && (s.active > 0 || !s.started.is_empty()) {
                return;
            }
            let Some((priority, token)) = s.pop_pending() else {
                return;
            };
            if let Queued::Wait = self.queue(s, token) {
                s.pending[priority].push_front(token);
                return;
            }
        }
    }

    /// Reserve resources for a new kcmd and start it
    fn queue(&self, s: &mut Scheduler, token: KcmdToken) -> Queued {
        let started_busy = !s.started.is_empty();
        let active = s.active;
        let Some(kcmd) = s.kcmds.get_mut(&token) else {
            return Queued::Done;
        };

        // Started kcmds promote in order, so nothing may jump ahead of them
        let reserved = if started_busy {
            self.reserve(kcmd, &self.started_pool)
                .map(|()| KcmdState::StartPrepared)
        } else {
            match self.reserve(kcmd, &self.running_pool) {
                Ok(()) => Ok(KcmdState::RunPrepared),
                Err(err) if err.is_exhaustion() && active > 0 => self
                    .reserve(kcmd, &self.started_pool)
                    .map(|()| KcmdState::StartPrepared),
                Err(err) => Err(err),
            }
        };

        match reserved {
            Ok(state) => {
                log::debug!("kcmd {}: {:?}", token, state);
                kcmd.state = state;
                self.start(s, token);
                Queued::Done
            }
            Err(err) if err.is_exhaustion() && (active > 0 || started_busy) => {
                log::debug!("kcmd {}: waiting for resources", token);
                Queued::Wait
            }
            Err(err) => {
                log::error!("kcmd {}: cannot reserve resources: {}", token, err);
                self.complete(s, token, Some(kcmd_error(err)));
                Queued::Done
            }
        }
    }

    fn reserve(&self, kcmd: &mut KernelCommand, pool: &LockedPool) -> Result<()> {
        allocate_resources(
            &mut kcmd.pg,
            &kcmd.manifest,
            &mut kcmd.resources,
            &mut pool.lock(),
            &self.config.resources,
        )
    }

    fn start(&self, s: &mut Scheduler, token: KcmdToken) {
        let now = self.clock.now_ms();
        let Some(kcmd) = s.kcmds.get_mut(&token) else {
            return;
        };

        let result = self
            .abi
            .pg_start(&mut kcmd.pg)
            .and_then(|()| self.abi.pg_disown(&mut kcmd.pg));
        if let Err(err) = result {
            log::error!("kcmd {}: start rejected: {}", token, err);
            self.complete(s, token, Some(KcmdError::BackendRejected(err)));
            return;
        }

        kcmd.watchdog.arm(now, self.config.watchdog_timeout_ms);
        kcmd.flags |= KcmdFlags::WATCHDOG_ARMED;
        if kcmd.state == KcmdState::RunPrepared {
            kcmd.state = KcmdState::Running;
            s.active += 1;
        } else {
            kcmd.state = KcmdState::Started;
            s.started.push_back(token);
        }
        log::debug!("kcmd {}: {:?}", token, kcmd.state);
    }

    /// Promote started kcmds into the running pool, oldest first
    fn run_started(&self, s: &mut Scheduler) {
        while let Some(&token) = s.started.front() {
            let Some(kcmd) = s.kcmds.get_mut(&token) else {
                s.started.pop_front();
                continue;
            };

            match LockedPool::transfer(&kcmd.resources, &self.started_pool, &self.running_pool) {
                Ok(()) => {
                    kcmd.state = KcmdState::Running;
                    kcmd.watchdog
                        .arm(self.clock.now_ms(), self.config.watchdog_timeout_ms);
                    s.started.pop_front();
                    s.active += 1;
                    log::debug!("kcmd {}: promoted to running", token);
                }
                Err(err) if err.is_exhaustion() && s.active > 0 => return,
                Err(err) => {
                    log::error!("kcmd {}: promotion failed: {}", token, err);
                    kcmd.flags |= KcmdFlags::ABORTED;
                    self.abort_on_firmware(kcmd);
                    self.complete(s, token, Some(KcmdError::Resources(err)));
                }
            }
        }
    }

    /// Release a kcmd's resources and post its completion
    ///
    /// No-op on a kcmd that is already complete.
    fn complete(&self, s: &mut Scheduler, token: KcmdToken, error: Option<KcmdError>) {
        let Some(kcmd) = s.kcmds.get_mut(&token) else {
            return;
        };
        let previous = kcmd.state;
        match previous {
            KcmdState::Complete => return,
            KcmdState::StartPrepared | KcmdState::Started => {
                self.started_pool.free(&mut kcmd.resources)
            }
            KcmdState::RunPrepared | KcmdState::Running => {
                self.running_pool.free(&mut kcmd.resources)
            }
            KcmdState::New => {}
        }

        kcmd.flags |= KcmdFlags::RELEASED;
        kcmd.flags.remove(KcmdFlags::WATCHDOG_ARMED);
        kcmd.watchdog.disarm();
        kcmd.state = KcmdState::Complete;
        kcmd.error = error;
        let event = kcmd.event();

        match error {
            Some(err) => log::error!("kcmd {}: failed in {:?}: {}", token, previous, err),
            None => log::debug!("kcmd {}: complete", token),
        }

        if previous == KcmdState::Running {
            s.active = s.active.saturating_sub(1);
        }
        s.unlink(token);
        s.completed.push_back(event);
    }
}

/// Every terminal gets exactly one buffer and the group has an address
fn check_bindings(pg: &ProcessGroup, params: &KcmdParams) -> Result<()> {
    if params.device_address == 0 {
        return Err(PsysError::NoDeviceAddress);
    }

    let count = pg.terminal_count();
    let mut bound = vec![false; count];
    for buffer in &params.buffers {
        let index = buffer.index;
        let slot = bound
            .get_mut(index)
            .ok_or(PsysError::TerminalOutOfRange { index, count })?;
        if core::mem::replace(slot, true) {
            return Err(PsysError::DuplicateTerminal { index });
        }
    }

    match bound.iter().position(|&is_bound| !is_bound) {
        Some(index) => Err(PsysError::UnboundTerminal { index }),
        None => Ok(()),
    }
}

fn kcmd_error(err: PsysError) -> KcmdError {
    match err {
        PsysError::Resource(err) => KcmdError::Resources(err),
        PsysError::Backend(err) => KcmdError::BackendRejected(err),
        _ => KcmdError::Unschedulable,
    }
}
