//! Device model: configuration attributes, identity, ports and backend contract
//!
//! A [`Device`] ties a storage [`Backend`] to the attributes the core emulates
//! on its behalf. Attributes are fixed once the device is built; the only
//! mutable state is the legacy reservation, the reset counter, ALUA group
//! membership and the pending-command queue, each behind its own lock.

use crate::command::Command;
use crate::error::{BackendError, TargetError, TargetResult};
use crate::task::{IoCompletion, Segment};
use crate::tmr::{ResetCompletion, TmrRequest};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Peripheral device type: direct access block device
pub const TYPE_DISK: u8 = 0x00;
/// Peripheral device type: sequential access device
pub const TYPE_TAPE: u8 = 0x01;
/// Peripheral qualifier/type reported for a LUN with nothing behind it
pub const TYPE_NO_LUN: u8 = 0x3F;

/// SPC-3 revision code; reported as SPC-4 in the version descriptors
pub const SCSI_SPC_3: u8 = 6;

/// Largest unit serial we will store (INQUIRY page 80h length byte minus NUL)
pub const MAX_UNIT_SERIAL_LEN: usize = 254;

/// T10 identity of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct T10Wwn {
    pub vendor: String,
    pub model: String,
    pub revision: String,
    /// Unit serial; VPD pages 00h/80h and the NAA designator exist only when set
    pub unit_serial: Option<String>,
}

impl Default for T10Wwn {
    fn default() -> Self {
        T10Wwn {
            vendor: "LIO-ORG".to_string(),
            model: "IBLOCK".to_string(),
            revision: "4.0".to_string(),
            unit_serial: None,
        }
    }
}

/// Per-device emulation attributes
#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    pub wwn: T10Wwn,
    /// Logical block size in bytes
    pub block_size: u32,
    pub emulate_write_cache: bool,
    pub emulate_fua_write: bool,
    pub emulate_tas: bool,
    /// Thin provisioning via UNMAP
    pub emulate_tpu: bool,
    /// Thin provisioning via WRITE SAME with UNMAP
    pub emulate_tpws: bool,
    /// UA interlock control: 0, 1 or 2
    pub emulate_ua_intlck_ctrl: u8,
    pub emulate_rest_reord: bool,
    /// Asymmetric logical unit access emulation
    pub emulate_alua: bool,
    pub is_nonrot: bool,
    pub max_unmap_lba_count: u32,
    pub max_unmap_block_desc_count: u32,
    pub unmap_granularity: u32,
    pub unmap_granularity_alignment: u32,
    pub fabric_max_sectors: u32,
    pub optimal_sectors: u32,
    /// Reservations handled by the backend hardware; enables hardware LUN reset
    pub offload_reservations: bool,
    /// How long LUN RESET waits for a hardware reset to finish
    pub lun_reset_timeout: Duration,
}

impl DeviceAttributes {
    pub fn builder() -> DeviceAttributesBuilder {
        DeviceAttributesBuilder::new()
    }

    /// UNMAP or WRITE SAME with UNMAP is advertised
    pub fn thin_provisioning(&self) -> bool {
        self.emulate_tpu || self.emulate_tpws
    }
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        DeviceAttributes {
            wwn: T10Wwn::default(),
            block_size: 512,
            emulate_write_cache: false,
            emulate_fua_write: true,
            emulate_tas: true,
            emulate_tpu: false,
            emulate_tpws: false,
            emulate_ua_intlck_ctrl: 0,
            emulate_rest_reord: false,
            emulate_alua: false,
            is_nonrot: false,
            max_unmap_lba_count: 0,
            max_unmap_block_desc_count: 0,
            unmap_granularity: 0,
            unmap_granularity_alignment: 0,
            fabric_max_sectors: 8192,
            optimal_sectors: 8192,
            offload_reservations: false,
            lun_reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Builder for [`DeviceAttributes`]
pub struct DeviceAttributesBuilder {
    attrs: DeviceAttributes,
}

impl DeviceAttributesBuilder {
    fn new() -> Self {
        Self {
            attrs: DeviceAttributes::default(),
        }
    }

    /// Set the T10 vendor identification (8 bytes max, default: LIO-ORG)
    pub fn vendor(mut self, vendor: &str) -> Self {
        self.attrs.wwn.vendor = vendor.to_string();
        self
    }

    /// Set the product identification (16 bytes max)
    pub fn model(mut self, model: &str) -> Self {
        self.attrs.wwn.model = model.to_string();
        self
    }

    /// Set the product revision level (4 bytes max)
    pub fn revision(mut self, revision: &str) -> Self {
        self.attrs.wwn.revision = revision.to_string();
        self
    }

    pub fn unit_serial(mut self, serial: &str) -> Self {
        self.attrs.wwn.unit_serial = Some(serial.to_string());
        self
    }

    /// Set the logical block size (default: 512)
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.attrs.block_size = block_size;
        self
    }

    pub fn write_cache(mut self, enabled: bool) -> Self {
        self.attrs.emulate_write_cache = enabled;
        self
    }

    pub fn fua_write(mut self, enabled: bool) -> Self {
        self.attrs.emulate_fua_write = enabled;
        self
    }

    pub fn tas(mut self, enabled: bool) -> Self {
        self.attrs.emulate_tas = enabled;
        self
    }

    pub fn tpu(mut self, enabled: bool) -> Self {
        self.attrs.emulate_tpu = enabled;
        self
    }

    pub fn tpws(mut self, enabled: bool) -> Self {
        self.attrs.emulate_tpws = enabled;
        self
    }

    pub fn ua_intlck_ctrl(mut self, mode: u8) -> Self {
        self.attrs.emulate_ua_intlck_ctrl = mode;
        self
    }

    pub fn rest_reord(mut self, enabled: bool) -> Self {
        self.attrs.emulate_rest_reord = enabled;
        self
    }

    pub fn alua(mut self, enabled: bool) -> Self {
        self.attrs.emulate_alua = enabled;
        self
    }

    pub fn non_rotational(mut self, nonrot: bool) -> Self {
        self.attrs.is_nonrot = nonrot;
        self
    }

    /// Set unmap limits: max LBA count and max block descriptor count
    pub fn unmap_limits(mut self, max_lba_count: u32, max_desc_count: u32) -> Self {
        self.attrs.max_unmap_lba_count = max_lba_count;
        self.attrs.max_unmap_block_desc_count = max_desc_count;
        self
    }

    pub fn unmap_granularity(mut self, granularity: u32, alignment: u32) -> Self {
        self.attrs.unmap_granularity = granularity;
        self.attrs.unmap_granularity_alignment = alignment;
        self
    }

    /// Set max and optimal transfer length in sectors
    pub fn transfer_sectors(mut self, max: u32, optimal: u32) -> Self {
        self.attrs.fabric_max_sectors = max;
        self.attrs.optimal_sectors = optimal;
        self
    }

    pub fn offload_reservations(mut self, enabled: bool) -> Self {
        self.attrs.offload_reservations = enabled;
        self
    }

    pub fn lun_reset_timeout(mut self, timeout: Duration) -> Self {
        self.attrs.lun_reset_timeout = timeout;
        self
    }

    /// Validate and build the attributes
    pub fn build(self) -> TargetResult<DeviceAttributes> {
        let attrs = self.attrs;
        let wwn = &attrs.wwn;

        if wwn.vendor.len() > 8 {
            return Err(TargetError::Config(format!(
                "vendor '{}' exceeds 8 bytes",
                wwn.vendor
            )));
        }
        if wwn.model.len() > 16 {
            return Err(TargetError::Config(format!(
                "model '{}' exceeds 16 bytes",
                wwn.model
            )));
        }
        if wwn.revision.len() > 4 {
            return Err(TargetError::Config(format!(
                "revision '{}' exceeds 4 bytes",
                wwn.revision
            )));
        }
        if let Some(serial) = &wwn.unit_serial {
            if !serial.is_ascii() || serial.len() > MAX_UNIT_SERIAL_LEN {
                return Err(TargetError::Config(format!(
                    "unit serial must be ASCII and at most {} bytes",
                    MAX_UNIT_SERIAL_LEN
                )));
            }
        }
        if attrs.block_size == 0 {
            return Err(TargetError::Config("block_size must be non-zero".to_string()));
        }
        if attrs.emulate_ua_intlck_ctrl > 2 {
            return Err(TargetError::Config(format!(
                "ua_intlck_ctrl must be 0, 1 or 2 (got {})",
                attrs.emulate_ua_intlck_ctrl
            )));
        }

        Ok(attrs)
    }
}

/// Lock-protected group membership
///
/// Readers get a copy of the current group and never hold the lock while
/// acting on it.
#[derive(Debug)]
pub struct GroupMembership<T: Copy> {
    group: Mutex<Option<T>>,
}

impl<T: Copy> Default for GroupMembership<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T: Copy> GroupMembership<T> {
    pub fn new(group: Option<T>) -> Self {
        Self {
            group: Mutex::new(group),
        }
    }

    pub fn current(&self) -> Option<T> {
        *self.group.lock()
    }

    pub fn set(&self, group: Option<T>) {
        *self.group.lock() = group;
    }
}

/// ALUA target port group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPortGroup {
    pub id: u16,
    /// TPGS bits reported in standard INQUIRY byte 5
    pub access_type: u8,
}

/// ALUA logical unit group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuGroup {
    pub id: u16,
}

/// Target port a command arrived through
#[derive(Debug)]
pub struct Port {
    /// Relative target port identifier
    pub rtpi: u16,
    /// SCSI transport protocol identifier of the fabric
    pub proto_ident: u8,
    /// Fabric WWN of the target portal group
    pub wwn: String,
    /// Target portal group tag
    pub tpgt: u16,
    /// Version descriptor for the fabric transport, if it has one
    pub fabric_vers_desc: Option<u16>,
    pub tg_pt_gp: GroupMembership<TargetPortGroup>,
}

impl Port {
    pub fn new(rtpi: u16, proto_ident: u8, wwn: &str, tpgt: u16) -> Self {
        Port {
            rtpi,
            proto_ident,
            wwn: wwn.to_string(),
            tpgt,
            fabric_vers_desc: None,
            tg_pt_gp: GroupMembership::default(),
        }
    }

    pub fn with_vers_desc(mut self, desc: u16) -> Self {
        self.fabric_vers_desc = Some(desc);
        self
    }
}

/// Logical unit as seen by an initiator
#[derive(Debug)]
pub struct Lun {
    pub id: u64,
    pub read_only: bool,
    pub port: Option<Arc<Port>>,
    /// The portal group's LUN 0 placeholder with no device behind it
    pub virtual_lun0: bool,
}

impl Lun {
    pub fn new(id: u64) -> Self {
        Lun {
            id,
            read_only: false,
            port: None,
            virtual_lun0: false,
        }
    }

    pub fn with_port(mut self, port: Arc<Port>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn virtual_lun0(mut self) -> Self {
        self.virtual_lun0 = true;
        self
    }
}

/// Limits on how much a single backend segment may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLimits {
    /// Scatter entries per segment
    pub max_segment_vecs: usize,
    /// Bytes per segment
    pub max_segment_bytes: usize,
}

impl Default for IoLimits {
    fn default() -> Self {
        IoLimits {
            max_segment_vecs: 256,
            max_segment_bytes: 1024 * 1024,
        }
    }
}

/// Storage backend contract
///
/// Implement this trait to put a real block device behind the target core.
/// Only plain segment submission is mandatory; the optional primitives are
/// exposed through the capability accessors, and commands that need a
/// missing capability fail with UNSUPPORTED SCSI OPCODE.
///
/// Asynchronous primitives receive an [`IoCompletion`] which must be
/// signalled exactly once, from any thread. Dropping it unsignalled counts
/// as a failed segment.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Last addressable logical block (READ CAPACITY semantics)
    fn last_lba(&self) -> u64;

    fn device_type(&self) -> u8 {
        TYPE_DISK
    }

    fn device_rev(&self) -> u8 {
        SCSI_SPC_3
    }

    /// Volume name for the vendor specific designator in VPD page 83h
    fn volume_name(&self) -> Option<String> {
        None
    }

    fn io_limits(&self) -> IoLimits {
        IoLimits::default()
    }

    /// Submit one read or write segment
    fn submit(&self, segment: Segment, io: IoCompletion);

    fn discard(&self) -> Option<&dyn Discard> {
        None
    }

    fn write_same(&self) -> Option<&dyn WriteSame> {
        None
    }

    fn compare_and_write(&self) -> Option<&dyn CompareAndWrite> {
        None
    }

    fn sync_cache(&self) -> Option<&dyn SyncCache> {
        None
    }

    fn lun_reset(&self) -> Option<&dyn LunReset> {
        None
    }
}

/// Synchronous block discard
pub trait Discard: Send + Sync {
    /// Discard `range` blocks starting at `lba` (logical block units)
    fn discard(&self, lba: u64, range: u64) -> Result<(), BackendError>;
}

/// Replicate one block of data over a block range
pub trait WriteSame: Send + Sync {
    /// `segment` holds the single block to replicate
    fn write_same(&self, segment: Segment, lba: u64, range: u64, io: IoCompletion);
}

/// Atomic compare and write
pub trait CompareAndWrite: Send + Sync {
    /// `segment` holds the verify data followed by the write data. The
    /// completion reports how many bytes matched via
    /// [`IoCompletion::complete_compare`].
    fn compare_and_write(&self, segment: Segment, range: u32, io: IoCompletion);
}

/// Write cache flush
pub trait SyncCache: Send + Sync {
    fn sync_cache(&self, io: IoCompletion);
}

/// Hardware logical unit reset
pub trait LunReset: Send + Sync {
    /// Start a reset; `done` must be signalled when the hardware has settled
    fn lun_reset(&self, tmr: &TmrRequest, done: ResetCompletion) -> Result<(), BackendError>;
}

/// A backend device with its emulated attributes
pub struct Device {
    name: String,
    attrs: DeviceAttributes,
    backend: Arc<dyn Backend>,
    lu_gp: GroupMembership<LuGroup>,
    /// Legacy SPC-2 reservation holder (initiator name)
    reservation: Mutex<Option<String>>,
    num_resets: Mutex<u64>,
    pub(crate) queue: Mutex<VecDeque<Arc<Command>>>,
}

impl Device {
    pub fn new(name: &str, attrs: DeviceAttributes, backend: Arc<dyn Backend>) -> Self {
        Device {
            name: name.to_string(),
            attrs,
            backend,
            lu_gp: GroupMembership::default(),
            reservation: Mutex::new(None),
            num_resets: Mutex::new(0),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> &DeviceAttributes {
        &self.attrs
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn lu_group(&self) -> &GroupMembership<LuGroup> {
        &self.lu_gp
    }

    /// Take the legacy whole-device reservation for `initiator`
    ///
    /// Fails if another initiator already holds it.
    pub fn reserve(&self, initiator: &str) -> Result<(), BackendError> {
        let mut holder = self.reservation.lock();
        match holder.as_deref() {
            Some(current) if current != initiator => Err(BackendError::ReservationConflict),
            _ => {
                *holder = Some(initiator.to_string());
                Ok(())
            }
        }
    }

    pub fn reservation_holder(&self) -> Option<String> {
        self.reservation.lock().clone()
    }

    /// Drop the reservation, returning whoever held it
    pub(crate) fn clear_reservation(&self) -> Option<String> {
        self.reservation.lock().take()
    }

    pub fn num_resets(&self) -> u64 {
        *self.num_resets.lock()
    }

    pub(crate) fn bump_resets(&self) {
        *self.num_resets.lock() += 1;
    }

    /// Commands waiting in the device queue
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("block_size", &self.attrs.block_size)
            .finish()
    }
}
