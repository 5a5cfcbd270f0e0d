//! Integration tests for the process system
//!
//! Jobs run against either the built-in backend, with a test thread playing
//! the firmware through `FirmwarePort`, or a scripted external backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ipu_cpd::{CpdError, DeviceBuffer, DeviceMemory, FirmwareBuilder};
use ipu_psys::*;
use psys_fw_com::{
    queue_pair, Doorbell, EventStatus, FirmwarePort, FwCom, ProcessGroupCommand, PsysEvent,
};
use psys_resources::{
    channel, CellMask, LockedPool, ResourceAllocationSet, ResourceDefs, ResourceError,
    ResourcePool,
};

struct ManualClock(Arc<AtomicU64>);

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct CountingDoorbell(Arc<AtomicUsize>);

impl Doorbell for CountingDoorbell {
    fn ring(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// External backend whose behaviour each test scripts
#[derive(Default)]
struct ScriptedAbi {
    reject_disown: bool,
    aborts: AtomicUsize,
    events: Mutex<VecDeque<PsysEvent>>,
}

struct SharedAbi(Arc<ScriptedAbi>);

impl PsysAbi for SharedAbi {
    fn pg_start(&self, _pg: &mut ProcessGroup) -> AbiResult<()> {
        Ok(())
    }

    fn pg_disown(&self, _pg: &mut ProcessGroup) -> AbiResult<()> {
        if self.0.reject_disown {
            return Err(AbiError::Rejected { op: "disown" });
        }
        Ok(())
    }

    fn pg_submit(&self, _pg: &mut ProcessGroup) -> AbiResult<()> {
        Ok(())
    }

    fn pg_abort(&self, _pg: &mut ProcessGroup) -> AbiResult<()> {
        self.0.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rcv_event(&self) -> Option<PsysEvent> {
        self.0.events.lock().unwrap().pop_front()
    }

    fn terminal_set(&self, pg: &mut ProcessGroup, buffer: &TerminalBuffer) -> AbiResult<()> {
        pg.set_param_terminal(buffer.index, buffer.device_address)
            .map_err(|_| AbiError::InvalidTerminal { index: buffer.index })
    }
}

fn external(abi: ScriptedAbi) -> (Psys, Arc<ScriptedAbi>, Arc<AtomicU64>) {
    let abi = Arc::new(abi);
    let time = Arc::new(AtomicU64::new(0));
    let config = PsysConfig {
        backend: BackendKind::External,
        ..PsysConfig::default()
    };
    let backend = AbiBackend::select(
        BackendKind::External,
        None,
        Some(Box::new(SharedAbi(abi.clone()))),
    )
    .unwrap();
    let psys = Psys::new(config, backend, Box::new(ManualClock(time.clone()))).unwrap();
    (psys, abi, time)
}

fn builtin() -> (Psys, FirmwarePort, Arc<AtomicUsize>) {
    let (host, firmware) = queue_pair();
    let rings = Arc::new(AtomicUsize::new(0));
    let com = FwCom::new(host, Box::new(CountingDoorbell(rings.clone())));
    let backend =
        AbiBackend::select(BackendKind::Builtin, Some(BuiltinAbi::new(com)), None).unwrap();
    let clock = Box::new(ManualClock(Arc::new(AtomicU64::new(0))));
    let psys = Psys::new(PsysConfig::default(), backend, clock).unwrap();
    (psys, firmware, rings)
}

/// One process on a type-2 cell with a DMA_EXT0 draw
fn job(user_token: u64) -> KcmdParams {
    KcmdParams {
        process_group: ProcessGroupBuilder::new(7)
            .process(100)
            .terminal(TerminalType::DataIn)
            .terminal(TerminalType::DataOut)
            .raw_terminal(0x77)
            .build(),
        pg_manifest: ProgramGroupManifest::new(7)
            .with_program(
                ProgramManifest::new(100, CellRequirement::Type(2))
                    .with_channel(channel::DMA_EXT0 as usize, 4),
            )
            .encode(),
        buffers: (0..3)
            .map(|index| TerminalBuffer {
                index,
                device_address: 0x10_0000 + index as u32 * 0x1000,
                size: 0x1000,
            })
            .collect(),
        device_address: 0x7000,
        priority: Priority::Medium,
        issue_id: 11,
        user_token,
    }
}

fn pools_idle(psys: &Psys) -> bool {
    psys.started_pool().lock().is_idle() && psys.running_pool().lock().is_idle()
}

#[test]
fn test_builtin_job_round_trip() {
    let (psys, mut firmware, rings) = builtin();

    let token = psys.submit(job(0xabc)).unwrap();
    assert_eq!(psys.state(token), Some(KcmdState::Running));
    assert!(rings.load(Ordering::SeqCst) >= 1);

    let command = firmware.next_command().expect("no start command");
    assert_eq!(command.command, ProcessGroupCommand::Start as u16);
    assert_eq!(command.context_handle, 0x7000);

    firmware
        .post_event(PsysEvent::new(EventStatus::Success, token))
        .unwrap();
    assert_eq!(psys.handle_events(), 1);

    let event = psys.next_event().expect("no completion");
    assert_eq!(event.token, token);
    assert_eq!(event.user_token, 0xabc);
    assert_eq!(event.issue_id, 11);
    assert_eq!(event.error, None);
    assert!(pools_idle(&psys));

    let pg = psys.release(token).unwrap().into_process_group();
    assert_eq!(pg.token(), token);
    assert_eq!(pg.state(), Some(PgState::Started));
    assert_eq!(pg.terminal(0).unwrap().buffer_state, BufferState::Full as u32);
    assert_eq!(pg.terminal(1).unwrap().buffer_state, BufferState::Empty as u32);
    // Unknown terminal type is skipped, not bound
    assert_eq!(pg.terminal(2).unwrap().buffer, 0);
}

#[test]
fn test_firmware_error_status_fails_job() {
    let (psys, mut firmware, _) = builtin();
    let token = psys.submit(job(1)).unwrap();
    firmware
        .post_event(PsysEvent::new(EventStatus::Error(0x21), token))
        .unwrap();
    psys.handle_events();

    let event = psys.next_event().unwrap();
    assert_eq!(event.error, Some(KcmdError::Firmware { status: 0x21 }));
    assert_eq!(event.error.unwrap().class(), ErrorClass::BackendRejected);
}

#[test]
fn test_reset_event_flushes_all_jobs() {
    let (psys, mut firmware, _) = builtin();
    let first = psys.submit(job(1)).unwrap();
    let second = psys.submit(job(2)).unwrap();

    firmware.post_event(PsysEvent::new(EventStatus::Success, 0)).unwrap();
    firmware.post_event(PsysEvent::new(EventStatus::Success, 999)).unwrap();
    assert_eq!(psys.handle_events(), 2);

    for token in [first, second] {
        assert_eq!(psys.state(token), Some(KcmdState::Complete));
    }
    let errors: Vec<_> = std::iter::from_fn(|| psys.next_event()).map(|e| e.error).collect();
    assert_eq!(errors, vec![Some(KcmdError::Reset); 2]);
    assert!(pools_idle(&psys));
}

#[test]
fn test_abort_twice_releases_once() {
    let (psys, abi, _) = external(ScriptedAbi::default());
    let token = psys.submit(job(1)).unwrap();
    assert!(!pools_idle(&psys));

    assert!(psys.abort(token).unwrap());
    assert!(pools_idle(&psys));
    assert!(!psys.abort(token).unwrap());

    assert_eq!(abi.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(psys.next_event().unwrap().error, Some(KcmdError::Aborted));
    assert!(psys.next_event().is_none());
}

#[test]
fn test_abort_after_event_is_noop() {
    let (psys, abi, _) = external(ScriptedAbi::default());
    let token = psys.submit(job(1)).unwrap();
    abi.events
        .lock()
        .unwrap()
        .push_back(PsysEvent::new(EventStatus::FragmentComplete, token));

    psys.handle_events();
    assert!(!psys.abort(token).unwrap());
    assert!(!psys.on_event(token, EventStatus::Success).unwrap());

    assert_eq!(abi.aborts.load(Ordering::SeqCst), 0);
    assert_eq!(psys.next_event().unwrap().error, None);
    assert!(psys.next_event().is_none());
    assert!(pools_idle(&psys));
}

#[test]
fn test_started_jobs_promote_in_order() {
    let (psys, abi, _) = external(ScriptedAbi::default());
    // Four type-2 cells: four jobs run, four wait started, one stays new
    let tokens: Vec<_> = (0..9).map(|i| psys.submit(job(i)).unwrap()).collect();
    assert_eq!(psys.active_count(), 4);
    assert_eq!(psys.started_count(), 4);
    assert_eq!(psys.pending_count(), 1);
    assert_eq!(psys.state(tokens[8]), Some(KcmdState::New));

    // Nothing was handed to the firmware for a new job
    assert!(psys.abort(tokens[8]).unwrap());
    assert_eq!(abi.aborts.load(Ordering::SeqCst), 0);

    assert!(psys.abort(tokens[4]).unwrap());
    assert_eq!(abi.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(psys.started_count(), 3);

    // tokens[5] holds the same cell and channel range as tokens[1]
    psys.on_event(tokens[1], EventStatus::Success).unwrap();
    assert_eq!(psys.state(tokens[5]), Some(KcmdState::Running));
    assert_eq!(psys.state(tokens[6]), Some(KcmdState::Started));
    assert_eq!(psys.active_count(), 4);
    assert_eq!(psys.started_count(), 2);

    psys.flush(KcmdError::Reset);
    assert!(pools_idle(&psys));
}

#[test]
fn test_watchdog_times_out_running_job() {
    let (psys, abi, time) = external(ScriptedAbi::default());
    let token = psys.submit(job(1)).unwrap();

    time.store(DEFAULT_WATCHDOG_TIMEOUT_MS - 1, Ordering::SeqCst);
    assert_eq!(psys.check_watchdogs(), 0);

    time.store(DEFAULT_WATCHDOG_TIMEOUT_MS, Ordering::SeqCst);
    assert_eq!(psys.check_watchdogs(), 1);
    assert_eq!(abi.aborts.load(Ordering::SeqCst), 1);

    let event = psys.next_event().unwrap();
    assert_eq!(event.error, Some(KcmdError::Timeout));
    assert_eq!(event.error.unwrap().class(), ErrorClass::Timeout);

    let kcmd = psys.release(token).unwrap();
    assert!(kcmd.flags().contains(KcmdFlags::TIMED_OUT));
    assert!(pools_idle(&psys));
    assert_eq!(psys.check_watchdogs(), 0);
}

#[test]
fn test_backend_rejection_fails_only_that_job() {
    let (psys, _abi, _) = external(ScriptedAbi {
        reject_disown: true,
        ..ScriptedAbi::default()
    });

    let token = psys.submit(job(5)).unwrap();
    assert_eq!(psys.state(token), Some(KcmdState::Complete));
    let event = psys.next_event().unwrap();
    assert_eq!(
        event.error,
        Some(KcmdError::BackendRejected(AbiError::Rejected { op: "disown" }))
    );
    assert!(pools_idle(&psys));
    assert_eq!(psys.active_count(), 0);
}

#[test]
fn test_submit_rejects_malformed_input() {
    let (psys, _abi, _) = external(ScriptedAbi::default());

    let mut params = job(1);
    params.process_group.truncate(40);
    assert!(matches!(
        psys.submit(params),
        Err(PsysError::InvalidProcessGroup { .. })
    ));

    let mut params = job(1);
    params.pg_manifest = ProgramGroupManifest::new(7).encode();
    let err = psys.submit(params).unwrap_err();
    assert!(matches!(err, PsysError::MissingProgram { program_id: 100 }));
    assert_eq!(err.class(), ErrorClass::Structural);
    assert_eq!(psys.pending_count(), 0);
}

#[test]
fn test_submit_requires_bound_terminals_and_address() {
    let (psys, mut firmware, rings) = builtin();

    let mut params = job(1);
    params.buffers.clear();
    params.device_address = 0;
    let err = psys.submit(params).unwrap_err();
    assert!(matches!(err, PsysError::NoDeviceAddress));
    assert_eq!(err.class(), ErrorClass::Structural);

    let mut params = job(1);
    params.buffers.pop();
    let err = psys.submit(params).unwrap_err();
    assert!(matches!(err, PsysError::UnboundTerminal { index: 2 }));
    assert!(!err.is_retryable());

    let mut params = job(1);
    params.buffers[2].index = 3;
    assert!(matches!(
        psys.submit(params),
        Err(PsysError::TerminalOutOfRange { index: 3, count: 3 })
    ));

    let mut params = job(1);
    params.buffers[2].index = 0;
    assert!(matches!(
        psys.submit(params),
        Err(PsysError::DuplicateTerminal { index: 0 })
    ));

    // Nothing reached the firmware or the pools
    assert!(firmware.next_command().is_none());
    assert_eq!(rings.load(Ordering::SeqCst), 0);
    assert_eq!(psys.pending_count() + psys.active_count(), 0);
    assert!(psys.next_event().is_none());
    assert!(pools_idle(&psys));

    let token = psys.submit(job(1)).unwrap();
    assert_eq!(psys.state(token), Some(KcmdState::Running));
    assert_eq!(firmware.next_command().unwrap().context_handle, 0x7000);
}

#[test]
fn test_concurrent_event_drains_complete_each_job_once() {
    let (psys, mut firmware, _) = builtin();
    let tokens: Vec<_> = (0..4).map(|i| psys.submit(job(i)).unwrap()).collect();
    assert_eq!(psys.active_count(), 4);
    for &token in &tokens {
        firmware
            .post_event(PsysEvent::new(EventStatus::Success, token))
            .unwrap();
    }

    let handled = std::thread::scope(|scope| {
        let first = scope.spawn(|| psys.handle_events());
        let second = scope.spawn(|| psys.handle_events());
        first.join().unwrap() + second.join().unwrap()
    });
    assert_eq!(handled, tokens.len());

    let events: Vec<_> = std::iter::from_fn(|| psys.next_event()).collect();
    assert!(events.iter().all(|event| event.error.is_none()));
    let mut completed: Vec<_> = events.iter().map(|event| event.token).collect();
    completed.sort_unstable();
    assert_eq!(completed, tokens);
    assert_eq!(psys.active_count(), 0);
    assert!(pools_idle(&psys));
}

#[test]
fn test_three_process_rollback_leaves_pool_untouched() {
    let defs = ResourceDefs::default();
    let mut pool = ResourcePool::new(&defs).unwrap();
    // Both type-1 cells are held by another job
    pool.reserve_cells(CellMask::from_bits(0b110)).unwrap();
    let cells_before = pool.cells();
    let channels_before: Vec<_> = pool.resources().iter().map(|r| r.allocated()).collect();

    let manifest = ProgramGroupManifest::new(1)
        .with_program(
            ProgramManifest::new(1, CellRequirement::Fixed(0))
                .with_channel(channel::DMA_EXT0 as usize, 8),
        )
        .with_program(
            ProgramManifest::new(2, CellRequirement::Fixed(9))
                .with_channel(channel::GDC as usize, 1),
        )
        .with_program(ProgramManifest::new(3, CellRequirement::Type(1)));
    let mut pg = ProcessGroup::parse(
        ProcessGroupBuilder::new(1).process(1).process(2).process(3).build(),
    )
    .unwrap();
    let pg_before = pg.clone();
    let mut set = ResourceAllocationSet::new();

    let err = allocate_resources(&mut pg, &manifest, &mut set, &mut pool, &defs).unwrap_err();
    assert!(matches!(
        err,
        PsysError::Resource(ResourceError::NoFreeCell { cell_type: 1 })
    ));
    assert_eq!(err.class(), ErrorClass::ResourceExhausted);
    assert!(err.is_retryable());

    assert_eq!(pool.cells(), cells_before);
    let channels_after: Vec<_> = pool.resources().iter().map(|r| r.allocated()).collect();
    assert_eq!(channels_after, channels_before);
    assert!(set.is_empty());
    assert_eq!(pg, pg_before);
}

#[test]
fn test_promotion_conflict_then_retry() {
    let defs = ResourceDefs::default();
    let started = LockedPool::new("started", ResourcePool::new(&defs).unwrap());
    let running = LockedPool::new("running", ResourcePool::new(&defs).unwrap());

    let manifest = ProgramGroupManifest::new(1).with_program(
        ProgramManifest::new(1, CellRequirement::Fixed(3))
            .with_channel(channel::DMA_EXT1_READ as usize, 6),
    );
    let mut pg = ProcessGroup::parse(ProcessGroupBuilder::new(1).process(1).build()).unwrap();
    let mut set = ResourceAllocationSet::new();
    allocate_resources(&mut pg, &manifest, &mut set, &mut started.lock(), &defs).unwrap();

    let blocker = CellMask::from_bits(1 << 3);
    running.lock().reserve_cells(blocker).unwrap();
    assert!(matches!(
        LockedPool::transfer(&set, &started, &running),
        Err(ResourceError::Conflict)
    ));
    assert!(started.lock().is_cell_reserved(3));
    assert_eq!(started.lock().resource(channel::DMA_EXT1_READ).unwrap().allocated(), 6);

    running.lock().release_cells(blocker);
    LockedPool::transfer(&set, &started, &running).unwrap();
    assert!(started.lock().is_idle());
    assert!(running.lock().is_cell_reserved(3));
    assert_eq!(running.lock().resource(channel::DMA_EXT1_READ).unwrap().allocated(), 6);
}

/// Bump allocator that tracks live buffers
struct TestMemory {
    next: u64,
    live: usize,
}

impl DeviceMemory for TestMemory {
    fn alloc(&mut self, size: usize) -> Option<DeviceBuffer> {
        let address = self.next;
        self.next += (size as u64 + 0xfff) & !0xfff;
        self.live += 1;
        Some(DeviceBuffer::new(address, vec![0; size].into_boxed_slice()))
    }

    fn free(&mut self, _buffer: DeviceBuffer) {
        self.live -= 1;
    }
}

fn firmware_blob() -> Vec<u8> {
    FirmwareBuilder::new(DEFAULT_FW_LIB_VERSION)
        .manifest(vec![0x11; 32])
        .component(1, 2, vec![0xaa; 64])
        .component(2, 2, vec![0xbb; 64])
        .build()
}

#[test]
fn test_firmware_load_and_unload() {
    let (psys, _firmware, _) = builtin();
    let mut memory = TestMemory {
        next: 0x2000_0000,
        live: 0,
    };

    psys.load_firmware(&firmware_blob(), 0x8000_0000, &mut memory)
        .unwrap();
    assert_eq!(psys.firmware_address(), Some(0x2000_0000));
    assert!(matches!(
        psys.load_firmware(&firmware_blob(), 0x8000_0000, &mut memory),
        Err(PsysError::FirmwareLoaded)
    ));
    assert_eq!(memory.live, 1);

    assert!(psys.unload_firmware(&mut memory));
    assert!(!psys.unload_firmware(&mut memory));
    assert_eq!(memory.live, 0);
    assert_eq!(psys.firmware_address(), None);
}

#[test]
fn test_malformed_firmware_fails_load() {
    let (psys, _firmware, _) = builtin();
    let mut memory = TestMemory {
        next: 0x2000_0000,
        live: 0,
    };

    let mut blob = firmware_blob();
    blob[0] ^= 0xff;
    let err = psys
        .load_firmware(&blob, 0x8000_0000, &mut memory)
        .unwrap_err();
    assert!(matches!(err, PsysError::Firmware(CpdError::BadMarker { .. })));
    assert_eq!(err.class(), ErrorClass::Structural);

    let config_version = psys.config().fw_lib_version;
    let stale = FirmwareBuilder::new(config_version - 1).build();
    assert!(matches!(
        psys.load_firmware(&stale, 0x8000_0000, &mut memory),
        Err(PsysError::Firmware(CpdError::VersionMismatch { .. }))
    ));

    assert_eq!(memory.live, 0);
    assert_eq!(psys.firmware_address(), None);
}
