//! SCSI target core emulation
//!
//! This library implements the command-processing core of a block storage
//! SCSI target: it synthesizes responses for INQUIRY, MODE SENSE/SELECT,
//! REQUEST SENSE and READ CAPACITY, splits READ/WRITE into backend segments,
//! delegates WRITE SAME, UNMAP, COMPARE AND WRITE and SYNCHRONIZE CACHE to
//! optional backend primitives, and handles ABORT TASK and LUN RESET.
//!
//! Users implement the [`Backend`] trait to provide the storage and the
//! [`Fabric`] trait to receive command status.
//!
//! # Example
//!
//! ```no_run
//! use scsi_target_core::{
//!     Backend, Command, Device, DeviceAttributes, Fabric, IoCompletion, Lun, Segment,
//!     SegmentOp, Session, TargetCore,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! struct MemDisk {
//!     data: Mutex<Vec<u8>>,
//! }
//!
//! impl Backend for MemDisk {
//!     fn name(&self) -> &str {
//!         "memdisk"
//!     }
//!
//!     fn last_lba(&self) -> u64 {
//!         (self.data.lock().unwrap().len() / 512) as u64 - 1
//!     }
//!
//!     fn submit(&self, segment: Segment, io: IoCompletion) {
//!         let offset = (segment.sector * 512) as usize;
//!         let mut data = self.data.lock().unwrap();
//!         match segment.op {
//!             SegmentOp::Read => segment.with_data(|buf| {
//!                 buf.copy_from_slice(&data[offset..offset + buf.len()])
//!             }),
//!             SegmentOp::Write | SegmentOp::WriteFua => {
//!                 let buf = segment.to_vec();
//!                 data[offset..offset + buf.len()].copy_from_slice(&buf);
//!             }
//!         }
//!         io.complete(Ok(()));
//!     }
//! }
//!
//! struct PrintFabric;
//!
//! impl Fabric for PrintFabric {
//!     fn queue_status(&self, cmd: &Command) {
//!         println!("tag {} status {:?}", cmd.tag(), cmd.status());
//!     }
//!
//!     fn release_cmd(&self, _cmd: &Command) {}
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(MemDisk { data: Mutex::new(vec![0u8; 1024 * 1024]) });
//! let attrs = DeviceAttributes::builder()
//!     .unit_serial("5e1f0a17c0de")
//!     .write_cache(true)
//!     .build()?;
//! let device = Arc::new(Device::new("disk1", attrs, backend));
//! let core = TargetCore::builder().device(device.clone()).build()?;
//!
//! let session = Arc::new(Session::new("iqn.2025-12.local:initiator", Arc::new(PrintFabric)));
//! let inquiry = Command::builder(device, Arc::new(Lun::new(0)), &[0x12, 0, 0, 0, 96, 0])
//!     .tag(1)
//!     .data_length(96)
//!     .session(session)
//!     .build()?;
//! core.execute(&inquiry);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cdb;
pub mod command;
pub mod device;
pub mod emulate;
pub mod error;
pub mod exec;
pub mod pages;
pub mod sense;
pub mod session;
pub mod target;
pub mod task;
pub mod tmr;

pub use command::{Command, CommandBuilder};
pub use device::{
    Backend, CompareAndWrite, Device, DeviceAttributes, DeviceAttributesBuilder, Discard,
    LunReset, Lun, Port, SyncCache, WriteSame,
};
pub use error::{BackendError, TargetError, TargetResult};
pub use sense::{SenseData, SenseReason};
pub use session::{Fabric, Session};
pub use target::{TargetCore, TargetCoreBuilder};
pub use task::{IoCompletion, Segment, SegmentOp};
pub use tmr::{ResetCompletion, TmrFunction, TmrRequest, TmrResponse};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
