//! Backend tasks and completion tokens
//!
//! A [`Task`] aggregates the backend segments issued for one command. Its
//! pending counter starts at 1: that extra unit belongs to the submitter and
//! is released only after every segment has been issued, so completions that
//! race with submission can never bring the counter to zero early. The
//! command completes exactly once, when the counter reaches zero.
//!
//! Every counted unit is represented by an [`IoCompletion`]. Tokens are
//! consumed when signalled; a token dropped without being signalled counts
//! as a failed segment, so a task can never be left hanging.

use crate::cdb;
use crate::command::Command;
use crate::error::BackendError;
use crate::sense::SenseReason;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Backend sector size all LBAs are converted to
pub const NATIVE_SECTOR_SIZE: u32 = 512;

/// Convert a logical block address to 512-byte backend sectors
pub fn native_sector(lba: u64, block_size: u32) -> Result<u64, SenseReason> {
    let shift = match block_size {
        4096 => 3,
        2048 => 2,
        1024 => 1,
        512 => 0,
        _ => {
            error!("unsupported SCSI -> block LBA conversion for block size {}", block_size);
            return Err(SenseReason::LogicalUnitCommunicationFailure);
        }
    };
    lba.checked_mul(1u64 << shift)
        .ok_or(SenseReason::AddressOutOfRange)
}

/// What a task asks of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Transfer,
    WriteSame,
    CompareAndWrite,
    SyncCache,
}

/// Direction and cache mode of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOp {
    Read,
    Write,
    /// Write that must reach stable storage before completing
    WriteFua,
}

/// One backend I/O: a contiguous window of the command's data buffer
pub struct Segment {
    cmd: Arc<Command>,
    /// Starting 512-byte sector
    pub sector: u64,
    pub op: SegmentOp,
    /// Byte offset into the command's data buffer
    pub offset: usize,
    pub len: usize,
    /// Scatter entries attached to this segment
    pub vecs: usize,
}

impl Segment {
    pub(crate) fn new(cmd: Arc<Command>, sector: u64, op: SegmentOp) -> Self {
        Segment {
            cmd,
            sector,
            op,
            offset: 0,
            len: 0,
            vecs: 0,
        }
    }

    pub fn command(&self) -> &Command {
        &self.cmd
    }

    /// Run `f` over this segment's bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let (start, end) = (self.offset, self.offset + self.len);
        self.cmd.with_data(|data| f(&mut data[start..end]))
    }

    /// Copy of this segment's bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(|data| data.to_vec())
    }

    /// The command's CDB narrowed to the blocks this segment covers
    ///
    /// For pass-through backends that forward each segment as its own
    /// command.
    pub fn cdb(&self) -> Result<Vec<u8>, SenseReason> {
        let block_size = self.cmd.device().attrs().block_size;
        let per_block = (block_size / NATIVE_SECTOR_SIZE).max(1) as u64;
        let lba = self.sector / per_block;
        let sectors = u32::try_from(self.len / block_size as usize)
            .map_err(|_| SenseReason::InvalidCdbField)?;

        let mut cdb = self.cmd.cdb().to_vec();
        cdb::rewrite_task_cdb(&mut cdb, lba, sectors)?;
        Ok(cdb)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("tag", &self.cmd.tag())
            .field("sector", &self.sector)
            .field("op", &self.op)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("vecs", &self.vecs)
            .finish()
    }
}

/// Aggregate of the backend work for one command
pub struct Task {
    cmd: Arc<Command>,
    kind: TaskKind,
    pending: AtomicU32,
    errors: AtomicU32,
    first_error: Mutex<Option<SenseReason>>,
    /// Bytes the backend reported as matching (compare and write)
    matched: Mutex<Option<u32>>,
    /// Bytes that must match for the compare to succeed
    compare_len: Mutex<Option<u32>>,
    fired: AtomicBool,
}

impl Task {
    /// Create a task and the submitter's token for the initial pending unit
    pub fn start(cmd: Arc<Command>, kind: TaskKind) -> (Arc<Task>, IoCompletion) {
        let task = Arc::new(Task {
            cmd,
            kind,
            pending: AtomicU32::new(1),
            errors: AtomicU32::new(0),
            first_error: Mutex::new(None),
            matched: Mutex::new(None),
            compare_len: Mutex::new(None),
            fired: AtomicBool::new(false),
        });
        let submitter = IoCompletion::for_task(Arc::clone(&task));
        (task, submitter)
    }

    /// Account for one more backend segment and return its token
    pub fn segment(self: &Arc<Self>) -> IoCompletion {
        self.pending.fetch_add(1, Ordering::AcqRel);
        IoCompletion::for_task(Arc::clone(self))
    }

    pub fn command(&self) -> &Arc<Command> {
        &self.cmd
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Acquire)
    }

    /// Byte count a compare and write must match in full
    pub(crate) fn expect_compare(&self, len: u32) {
        *self.compare_len.lock() = Some(len);
    }

    fn record_error(&self, reason: SenseReason) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(reason);
        }
    }

    fn record_match(&self, matched: u32) {
        *self.matched.lock() = Some(matched);
    }

    fn put(&self) {
        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.finish(),
            Ok(_) => {}
            Err(_) => error!(
                "task for tag {} released below zero pending segments",
                self.cmd.tag()
            ),
        }
    }

    fn finish(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            error!("task for tag {} fired twice", self.cmd.tag());
            return;
        }

        let result = if self.errors() > 0 {
            Err(self
                .first_error
                .lock()
                .unwrap_or(SenseReason::LogicalUnitCommunicationFailure))
        } else if self.kind == TaskKind::CompareAndWrite {
            match (*self.matched.lock(), *self.compare_len.lock()) {
                (Some(matched), Some(expected)) if matched < expected => {
                    Err(SenseReason::MiscompareDuringVerify { offset: matched })
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        };

        debug!(
            "task {:?} for tag {} done: {:?}",
            self.kind,
            self.cmd.tag(),
            result
        );
        self.cmd.complete(result);
    }
}

enum Sink {
    Task(Arc<Task>),
    /// Nobody waits for the result; failures are only logged
    Detached { tag: u64, what: &'static str },
    Settled,
}

/// Move-only completion signal for one unit of backend work
///
/// Signal it with [`complete`](IoCompletion::complete),
/// [`complete_compare`](IoCompletion::complete_compare) or
/// [`fail`](IoCompletion::fail). Dropping it unsignalled records a failure.
#[must_use = "an unsignalled completion fails its command"]
pub struct IoCompletion {
    sink: Sink,
}

impl IoCompletion {
    fn for_task(task: Arc<Task>) -> Self {
        IoCompletion {
            sink: Sink::Task(task),
        }
    }

    /// A completion whose outcome is only logged
    pub fn detached(tag: u64, what: &'static str) -> Self {
        IoCompletion {
            sink: Sink::Detached { tag, what },
        }
    }

    /// Signal a finished read, write, write same or flush
    pub fn complete(mut self, result: Result<(), BackendError>) {
        let outcome = result.map_err(|e| {
            error!("backend I/O error: {}", e);
            e.sense_reason()
        });
        self.settle(outcome, None);
    }

    /// Signal a finished compare and write with the number of bytes that matched
    pub fn complete_compare(mut self, result: Result<u32, BackendError>) {
        match result {
            Ok(matched) => self.settle(Ok(()), Some(matched)),
            Err(e) => {
                error!("compare and write failed: {}", e);
                self.settle(Err(e.sense_reason()), None);
            }
        }
    }

    /// Fail this unit with a specific sense reason
    pub fn fail(mut self, reason: SenseReason) {
        self.settle(Err(reason), None);
    }

    fn settle(&mut self, outcome: Result<(), SenseReason>, matched: Option<u32>) {
        match std::mem::replace(&mut self.sink, Sink::Settled) {
            Sink::Task(task) => {
                if let Some(matched) = matched {
                    task.record_match(matched);
                }
                if let Err(reason) = outcome {
                    task.record_error(reason);
                }
                task.put();
            }
            Sink::Detached { tag, what } => {
                if let Err(reason) = outcome {
                    warn!("{} for tag {} failed: {}", what, tag, reason);
                }
            }
            Sink::Settled => {}
        }
    }
}

impl Drop for IoCompletion {
    fn drop(&mut self) {
        if !matches!(self.sink, Sink::Settled) {
            warn!("completion dropped without being signalled");
            self.settle(Err(BackendError::Abandoned.sense_reason()), None);
        }
    }
}

impl std::fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.sink {
            Sink::Task(task) => format!("task tag {}", task.cmd.tag()),
            Sink::Detached { tag, what } => format!("detached {} tag {}", what, tag),
            Sink::Settled => "settled".to_string(),
        };
        f.debug_struct("IoCompletion").field("sink", &state).finish()
    }
}
