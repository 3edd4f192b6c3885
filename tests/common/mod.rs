//! Shared harness for the integration tests
//!
//! Devices come from `tests/fixtures/devices.toml`. The mock backend records
//! every call and can hold completions back so tests control when backend
//! work settles.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use scsi_target_core::device::IoLimits;
use scsi_target_core::{
    Backend, BackendError, Command, CommandBuilder, CompareAndWrite, Device, DeviceAttributes,
    Discard, Fabric, IoCompletion, Lun, LunReset, ResetCompletion, Segment, SegmentOp, Session,
    SyncCache, TargetCore, TmrRequest, WriteSame,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const INITIATOR: &str = "iqn.2025-12.local:initiator-a";
pub const OTHER_INITIATOR: &str = "iqn.2025-12.local:initiator-b";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Device fixtures
// ============================================================================

#[derive(Debug, Clone)]
pub struct DeviceFixture {
    pub name: String,
    pub block_size: u32,
    pub last_lba: u64,
    pub serial: Option<String>,
    pub write_cache: bool,
    pub tpu: bool,
    pub tpws: bool,
    pub tas: bool,
    pub alua: bool,
    pub non_rotational: bool,
    pub offload_reservations: bool,
    pub max_unmap_lba_count: u32,
    pub max_unmap_block_desc_count: u32,
    pub unmap_granularity: u32,
    pub unmap_granularity_alignment: u32,
}

static FIXTURES: Lazy<Vec<DeviceFixture>> = Lazy::new(|| {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/devices.toml");
    let contents = std::fs::read_to_string(path).expect("Failed to read devices.toml");
    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse devices.toml - invalid TOML syntax");
    let devices = config
        .get("device")
        .and_then(|d| d.as_array())
        .expect("Missing [[device]] entries in devices.toml");

    devices
        .iter()
        .map(|d| {
            let int = |key: &str, default: i64| d.get(key).and_then(|v| v.as_integer()).unwrap_or(default);
            let flag = |key: &str, default: bool| d.get(key).and_then(|v| v.as_bool()).unwrap_or(default);
            DeviceFixture {
                name: d
                    .get("name")
                    .and_then(|v| v.as_str())
                    .expect("device fixture without a name")
                    .to_string(),
                block_size: int("block_size", 512) as u32,
                last_lba: int("last_lba", 1023) as u64,
                serial: d.get("serial").and_then(|v| v.as_str()).map(str::to_string),
                write_cache: flag("write_cache", false),
                tpu: flag("tpu", false),
                tpws: flag("tpws", false),
                tas: flag("tas", true),
                alua: flag("alua", false),
                non_rotational: flag("non_rotational", false),
                offload_reservations: flag("offload_reservations", false),
                max_unmap_lba_count: int("max_unmap_lba_count", 0) as u32,
                max_unmap_block_desc_count: int("max_unmap_block_desc_count", 0) as u32,
                unmap_granularity: int("unmap_granularity", 0) as u32,
                unmap_granularity_alignment: int("unmap_granularity_alignment", 0) as u32,
            }
        })
        .collect()
});

pub fn fixture(name: &str) -> &'static DeviceFixture {
    FIXTURES
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("no device fixture named {}", name))
}

pub fn attrs(fix: &DeviceFixture) -> DeviceAttributes {
    let mut builder = DeviceAttributes::builder()
        .block_size(fix.block_size)
        .write_cache(fix.write_cache)
        .tpu(fix.tpu)
        .tpws(fix.tpws)
        .tas(fix.tas)
        .alua(fix.alua)
        .non_rotational(fix.non_rotational)
        .offload_reservations(fix.offload_reservations)
        .unmap_limits(fix.max_unmap_lba_count, fix.max_unmap_block_desc_count)
        .unmap_granularity(fix.unmap_granularity, fix.unmap_granularity_alignment)
        .lun_reset_timeout(Duration::from_secs(5));
    if let Some(serial) = &fix.serial {
        builder = builder.unit_serial(serial);
    }
    builder.build().expect("invalid device fixture")
}

// ============================================================================
// Mock backend
// ============================================================================

/// Optional primitives the mock backend exposes
#[derive(Debug, Clone, Copy, Default)]
pub struct Caps {
    pub discard: bool,
    pub write_same: bool,
    pub compare_and_write: bool,
    pub sync_cache: bool,
    pub lun_reset: bool,
}

impl Caps {
    pub fn none() -> Self {
        Caps::default()
    }

    pub fn discard_only() -> Self {
        Caps {
            discard: true,
            ..Caps::default()
        }
    }

    pub fn all() -> Self {
        Caps {
            discard: true,
            write_same: true,
            compare_and_write: true,
            sync_cache: true,
            lun_reset: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRecord {
    pub sector: u64,
    pub op: SegmentOp,
    pub len: usize,
    pub vecs: usize,
}

pub struct MockBackend {
    last_lba: u64,
    caps: Caps,
    limits: IoLimits,
    volume_name: Option<String>,
    disk: Mutex<HashMap<u64, Vec<u8>>>,
    pub submitted: Mutex<Vec<SubmitRecord>>,
    pub discards: Mutex<Vec<(u64, u64)>>,
    pub write_sames: Mutex<Vec<(u64, u64, Vec<u8>)>>,
    pub compares: Mutex<Vec<(u64, u32, usize)>>,
    pub flushes: AtomicUsize,
    pub resets: AtomicUsize,
    /// Hold completions in `held` instead of signalling them
    defer: AtomicBool,
    held: Mutex<Vec<(IoCompletion, Result<(), BackendError>)>>,
    /// Fail the segment with this submission index
    fail_at: Mutex<Option<(usize, BackendError)>>,
    discard_error: Mutex<Option<BackendError>>,
    /// Bytes reported as matching by compare and write; None means all
    caw_match: Mutex<Option<u32>>,
}

impl MockBackend {
    pub fn new(last_lba: u64, caps: Caps) -> Self {
        MockBackend {
            last_lba,
            caps,
            limits: IoLimits::default(),
            volume_name: None,
            disk: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            discards: Mutex::new(Vec::new()),
            write_sames: Mutex::new(Vec::new()),
            compares: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            defer: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
            discard_error: Mutex::new(None),
            caw_match: Mutex::new(None),
        }
    }

    pub fn with_limits(mut self, limits: IoLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_volume_name(mut self, name: &str) -> Self {
        self.volume_name = Some(name.to_string());
        self
    }

    pub fn defer_completions(&self, defer: bool) {
        self.defer.store(defer, Ordering::SeqCst);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Signal every held completion, returning how many there were
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        let n = held.len();
        for (io, result) in held {
            io.complete(result);
        }
        n
    }

    pub fn fail_segment(&self, index: usize, err: BackendError) {
        *self.fail_at.lock() = Some((index, err));
    }

    pub fn fail_discard(&self, err: BackendError) {
        *self.discard_error.lock() = Some(err);
    }

    pub fn report_match(&self, matched: u32) {
        *self.caw_match.lock() = Some(matched);
    }

    fn finish(&self, io: IoCompletion, result: Result<(), BackendError>) {
        if self.defer.load(Ordering::SeqCst) {
            self.held.lock().push((io, result));
        } else {
            io.complete(result);
        }
    }

    fn transfer(&self, segment: &Segment) {
        let mut disk = self.disk.lock();
        match segment.op {
            SegmentOp::Read => segment.with_data(|buf| {
                for (i, chunk) in buf.chunks_mut(512).enumerate() {
                    if let Some(stored) = disk.get(&(segment.sector + i as u64)) {
                        chunk.copy_from_slice(&stored[..chunk.len()]);
                    }
                }
            }),
            SegmentOp::Write | SegmentOp::WriteFua => {
                let data = segment.to_vec();
                for (i, chunk) in data.chunks(512).enumerate() {
                    disk.insert(segment.sector + i as u64, chunk.to_vec());
                }
            }
        }
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn last_lba(&self) -> u64 {
        self.last_lba
    }

    fn volume_name(&self) -> Option<String> {
        self.volume_name.clone()
    }

    fn io_limits(&self) -> IoLimits {
        self.limits
    }

    fn submit(&self, segment: Segment, io: IoCompletion) {
        let index = {
            let mut submitted = self.submitted.lock();
            submitted.push(SubmitRecord {
                sector: segment.sector,
                op: segment.op,
                len: segment.len,
                vecs: segment.vecs,
            });
            submitted.len() - 1
        };
        let result = match &*self.fail_at.lock() {
            Some((at, err)) if *at == index => Err(err.clone()),
            _ => Ok(()),
        };
        if result.is_ok() {
            self.transfer(&segment);
        }
        self.finish(io, result);
    }

    fn discard(&self) -> Option<&dyn Discard> {
        if self.caps.discard {
            Some(self as &dyn Discard)
        } else {
            None
        }
    }

    fn write_same(&self) -> Option<&dyn WriteSame> {
        if self.caps.write_same {
            Some(self as &dyn WriteSame)
        } else {
            None
        }
    }

    fn compare_and_write(&self) -> Option<&dyn CompareAndWrite> {
        if self.caps.compare_and_write {
            Some(self as &dyn CompareAndWrite)
        } else {
            None
        }
    }

    fn sync_cache(&self) -> Option<&dyn SyncCache> {
        if self.caps.sync_cache {
            Some(self as &dyn SyncCache)
        } else {
            None
        }
    }

    fn lun_reset(&self) -> Option<&dyn LunReset> {
        if self.caps.lun_reset {
            Some(self as &dyn LunReset)
        } else {
            None
        }
    }
}

impl Discard for MockBackend {
    fn discard(&self, lba: u64, range: u64) -> Result<(), BackendError> {
        if let Some(err) = self.discard_error.lock().clone() {
            return Err(err);
        }
        self.discards.lock().push((lba, range));
        Ok(())
    }
}

impl WriteSame for MockBackend {
    fn write_same(&self, segment: Segment, lba: u64, range: u64, io: IoCompletion) {
        self.write_sames.lock().push((lba, range, segment.to_vec()));
        self.finish(io, Ok(()));
    }
}

impl CompareAndWrite for MockBackend {
    fn compare_and_write(&self, segment: Segment, range: u32, io: IoCompletion) {
        self.compares.lock().push((segment.sector, range, segment.len));
        let matched = self.caw_match.lock().unwrap_or(segment.len as u32);
        io.complete_compare(Ok(matched));
    }
}

impl SyncCache for MockBackend {
    fn sync_cache(&self, io: IoCompletion) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.finish(io, Ok(()));
    }
}

impl LunReset for MockBackend {
    fn lun_reset(&self, _tmr: &TmrRequest, done: ResetCompletion) -> Result<(), BackendError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            done.complete();
        });
        Ok(())
    }
}

// ============================================================================
// Recording fabric
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub tag: u64,
    pub status: Option<u8>,
    pub sense: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct RecordingFabric {
    pub statuses: Mutex<Vec<StatusRecord>>,
    pub released: Mutex<Vec<u64>>,
}

impl RecordingFabric {
    /// Every status delivered for `tag`
    pub fn statuses_for(&self, tag: u64) -> Vec<Option<u8>> {
        self.statuses
            .lock()
            .iter()
            .filter(|s| s.tag == tag)
            .map(|s| s.status)
            .collect()
    }

    pub fn was_released(&self, tag: u64) -> bool {
        self.released.lock().contains(&tag)
    }
}

impl Fabric for RecordingFabric {
    fn queue_status(&self, cmd: &Command) {
        self.statuses.lock().push(StatusRecord {
            tag: cmd.tag(),
            status: cmd.status(),
            sense: cmd.sense(),
        });
    }

    fn release_cmd(&self, cmd: &Command) {
        self.released.lock().push(cmd.tag());
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub core: TargetCore,
    pub dev: Arc<Device>,
    pub backend: Arc<MockBackend>,
    pub fabric: Arc<RecordingFabric>,
    pub session: Arc<Session>,
    pub lun: Arc<Lun>,
    next_tag: AtomicU64,
}

impl Harness {
    pub fn new(fixture_name: &str, caps: Caps) -> Self {
        Self::build(fixture_name, caps, Lun::new(0), |b| b)
    }

    pub fn with_lun(fixture_name: &str, caps: Caps, lun: Lun) -> Self {
        Self::build(fixture_name, caps, lun, |b| b)
    }

    pub fn build(
        fixture_name: &str,
        caps: Caps,
        lun: Lun,
        customize: impl FnOnce(MockBackend) -> MockBackend,
    ) -> Self {
        init_logging();
        let fix = fixture(fixture_name);
        let backend = Arc::new(customize(MockBackend::new(fix.last_lba, caps)));
        let dev = Arc::new(Device::new(&fix.name, attrs(fix), backend.clone()));
        let core = TargetCore::builder()
            .device(dev.clone())
            .build()
            .expect("failed to build target core");
        let fabric = Arc::new(RecordingFabric::default());
        let session = Arc::new(Session::new(INITIATOR, fabric.clone()));
        Harness {
            core,
            dev,
            backend,
            fabric,
            session,
            lun: Arc::new(lun),
            next_tag: AtomicU64::new(1),
        }
    }

    /// A second session on the same fabric
    pub fn session(&self, initiator: &str) -> Arc<Session> {
        Arc::new(Session::new(initiator, self.fabric.clone()))
    }

    pub fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::SeqCst)
    }

    /// Command builder with a fresh tag on the default session
    pub fn cmd(&self, cdb: &[u8]) -> CommandBuilder {
        Command::builder(self.dev.clone(), self.lun.clone(), cdb)
            .tag(self.next_tag())
            .session(self.session.clone())
    }

    /// Execute a data-in command with `alloc` bytes of buffer
    pub fn run_in(&self, cdb: &[u8], alloc: u32) -> Arc<Command> {
        let cmd = self.cmd(cdb).data_length(alloc).build().expect("bad command");
        self.core.execute(&cmd);
        cmd
    }

    /// Execute a data-out command
    pub fn run_out(&self, cdb: &[u8], data: Vec<u8>) -> Arc<Command> {
        let cmd = self.cmd(cdb).data_out(data).build().expect("bad command");
        self.core.execute(&cmd);
        cmd
    }
}

/// (sense key, ASC, ASCQ) of a failed command
pub fn sense_triple(cmd: &Command) -> (u8, u8, u8) {
    let sense = cmd.sense().expect("command has no sense data");
    (sense[2] & 0x0f, sense[12], sense[13])
}

pub fn read10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

pub fn write10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read10(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}
