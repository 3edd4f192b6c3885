//! SCSI commands and their completion state
//!
//! A [`Command`] is shared between the fabric (through its session) and the
//! backend (through any in-flight task), so it lives behind an `Arc` and
//! keeps its mutable state under one lock. The state machine is
//! `sent -> complete` or `sent -> aborted -> complete`; status reaches the
//! fabric at most once.

use crate::cdb::{self, CommandClass, DataDirection};
use crate::device::{Device, Lun};
use crate::error::{TargetError, TargetResult};
use crate::sense::{scsi_status, SenseReason};
use crate::session::Session;
use crate::tmr::TmrFunction;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Default scatter entry size
pub const DEFAULT_SG_ENTRY_LEN: usize = 4096;

/// Mutable per-command state
#[derive(Debug, Clone, Default)]
pub struct CommandState {
    /// Waiting in the device queue
    pub queued: bool,
    /// Handed to emulation or the backend and not yet completed
    pub sent: bool,
    pub aborted: bool,
    pub complete: bool,
    pub status: u8,
    pub sense_reason: Option<SenseReason>,
    pub sense: Option<Vec<u8>>,
    /// Bytes of the data buffer not transferred
    pub residual: u32,
}

/// A SCSI command
pub struct Command {
    tag: u64,
    cdb: Vec<u8>,
    lba: u64,
    sectors: u32,
    data_length: u32,
    direction: DataDirection,
    fua: bool,
    /// Reservation key of the I_T nexus, for PREEMPT AND ABORT matching
    pr_res_key: u64,
    tmr: Option<TmrFunction>,
    data: Mutex<Vec<u8>>,
    sgl: Vec<usize>,
    device: Arc<Device>,
    lun: Arc<Lun>,
    session: Option<Arc<Session>>,
    /// References still held by the frontend that expect status
    frontend_refs: AtomicU32,
    /// Session references; see [`Session::put_cmd`]
    refs: AtomicU32,
    /// Fabric holds an extra acknowledgement reference
    ack_ref: AtomicBool,
    state: Mutex<CommandState>,
    settled: Condvar,
}

impl Command {
    pub fn builder(device: Arc<Device>, lun: Arc<Lun>, cdb: &[u8]) -> CommandBuilder {
        CommandBuilder::new(device, lun, cdb)
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    /// First CDB byte; task management commands have no CDB and report 0
    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    /// Starting logical block, in device block size units
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Transfer length in logical blocks
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    pub fn data_length(&self) -> u32 {
        self.data_length
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn fua(&self) -> bool {
        self.fua
    }

    pub fn pr_res_key(&self) -> u64 {
        self.pr_res_key
    }

    /// Task management function carried by this command, if it is a TMR
    pub fn tmr_function(&self) -> Option<TmrFunction> {
        self.tmr
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn lun(&self) -> &Lun {
        &self.lun
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn initiator_name(&self) -> Option<&str> {
        self.session.as_deref().map(|s| s.initiator_name())
    }

    /// Lengths of the scatter entries covering the data buffer
    pub fn sgl(&self) -> &[usize] {
        &self.sgl
    }

    /// Run `f` over the whole data buffer
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock();
        f(&mut data)
    }

    /// Copy of the data buffer
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub(crate) fn replace_data(&self, data: Vec<u8>) {
        *self.data.lock() = data;
    }

    /// Copy a synthesized response into the data buffer
    ///
    /// The response is truncated to the allocation length; a shorter response
    /// leaves the remainder as residual.
    pub fn fill_response(&self, response: &[u8]) {
        let copied = {
            let mut data = self.data.lock();
            let n = response.len().min(data.len());
            data[..n].copy_from_slice(&response[..n]);
            n
        };
        self.state.lock().residual = self.data_length.saturating_sub(copied as u32);
    }

    pub fn frontend_refs(&self) -> u32 {
        self.frontend_refs.load(Ordering::Acquire)
    }

    /// The frontend no longer expects status for this command
    pub fn drop_frontend_ref(&self) {
        let _ = self
            .frontend_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn has_ack_ref(&self) -> bool {
        self.ack_ref.load(Ordering::Acquire)
    }

    /// Consume the acknowledgement reference, returning whether it was held
    pub(crate) fn take_ack_ref(&self) -> bool {
        self.ack_ref.swap(false, Ordering::AcqRel)
    }

    /// Take an extra session reference, dropped again with `put_cmd`
    pub(crate) fn get_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one session reference; true when it was the last one
    pub(crate) fn put_ref(&self) -> bool {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                warn!("command tag {} released more often than referenced", self.tag);
                false
            }
        }
    }

    /// Snapshot of the command state
    pub fn state(&self) -> CommandState {
        self.state.lock().clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn is_sent(&self) -> bool {
        self.state.lock().sent
    }

    /// Status byte, once complete
    pub fn status(&self) -> Option<u8> {
        let state = self.state.lock();
        state.complete.then_some(state.status)
    }

    pub fn sense(&self) -> Option<Vec<u8>> {
        self.state.lock().sense.clone()
    }

    pub fn sense_reason(&self) -> Option<SenseReason> {
        self.state.lock().sense_reason
    }

    pub fn residual(&self) -> u32 {
        self.state.lock().residual
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.state.lock().queued = queued;
    }

    /// Mark the command as handed to execution
    ///
    /// Returns false if it was aborted first, in which case it must not run.
    pub(crate) fn mark_sent(&self) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.queued = false;
        state.sent = true;
        true
    }

    /// Deliver the final result of execution
    ///
    /// Only the first completion of a live command reaches the fabric. A
    /// completion of an aborted command just wakes the aborter.
    pub fn complete(&self, result: Result<(), SenseReason>) {
        let deliver = {
            let mut state = self.state.lock();
            state.sent = false;
            if state.complete {
                warn!(
                    "command tag {} completed twice, dropping {:?}",
                    self.tag, result
                );
                false
            } else if state.aborted {
                debug!("command tag {} finished after abort", self.tag);
                false
            } else {
                match result {
                    Ok(()) => state.status = scsi_status::GOOD,
                    Err(reason) => {
                        state.status = reason.status();
                        state.sense_reason = Some(reason);
                        state.sense = reason.sense_data().map(|s| s.to_bytes());
                    }
                }
                state.complete = true;
                true
            }
        };
        self.settled.notify_all();
        if deliver {
            if let Some(session) = &self.session {
                session.fabric().queue_status(self);
            }
        }
    }

    /// Set the aborted flag unless the command already completed
    pub(crate) fn try_mark_aborted(&self) -> bool {
        let mut state = self.state.lock();
        if state.complete {
            return false;
        }
        state.aborted = true;
        true
    }

    /// Abort a command pulled off the device queue
    pub(crate) fn mark_aborted_from_queue(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.queued = false;
    }

    /// Block until no execution is in flight for this command
    pub(crate) fn wait_for_tasks(&self) {
        let mut state = self.state.lock();
        while state.sent {
            self.settled.wait(&mut state);
        }
    }

    /// Complete the command with TASK ABORTED status
    pub(crate) fn send_task_abort(&self) {
        {
            let mut state = self.state.lock();
            if state.complete {
                return;
            }
            state.status = scsi_status::TASK_ABORTED;
            state.sense_reason = None;
            state.sense = None;
            state.residual = self.data_length;
            state.complete = true;
        }
        self.settled.notify_all();
        if let Some(session) = &self.session {
            session.fabric().queue_status(self);
        }
    }

    /// Put an aborted command into its terminal state
    ///
    /// With `remove` the core also drops the session's reference; otherwise
    /// the frontend still owns it and releases it later.
    pub(crate) fn finish_abort(&self, remove: bool) {
        self.state.lock().complete = true;
        self.settled.notify_all();
        if remove {
            if let Some(session) = &self.session {
                session.put_cmd(self);
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("tag", &self.tag)
            .field("opcode", &format_args!("{:#04x}", self.opcode()))
            .field("lba", &self.lba)
            .field("sectors", &self.sectors)
            .field("data_length", &self.data_length)
            .finish()
    }
}

/// Builder for [`Command`]
pub struct CommandBuilder {
    device: Arc<Device>,
    lun: Arc<Lun>,
    cdb: Vec<u8>,
    tag: u64,
    data: Option<Vec<u8>>,
    data_length: Option<u32>,
    sg_entry_len: usize,
    sgl: Option<Vec<usize>>,
    session: Option<Arc<Session>>,
    pr_res_key: u64,
    tmr: Option<TmrFunction>,
    frontend_refs: u32,
    ack_ref: bool,
}

impl CommandBuilder {
    fn new(device: Arc<Device>, lun: Arc<Lun>, cdb: &[u8]) -> Self {
        Self {
            device,
            lun,
            cdb: cdb.to_vec(),
            tag: 0,
            data: None,
            data_length: None,
            sg_entry_len: DEFAULT_SG_ENTRY_LEN,
            sgl: None,
            session: None,
            pr_res_key: 0,
            tmr: None,
            frontend_refs: 1,
            ack_ref: false,
        }
    }

    /// Initiator task tag
    pub fn tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Data-out buffer received from the initiator
    pub fn data_out(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Size of the data-in buffer to allocate
    pub fn data_length(mut self, len: u32) -> Self {
        self.data_length = Some(len);
        self
    }

    /// Split the data buffer into scatter entries of `len` bytes
    pub fn sg_entry_len(mut self, len: usize) -> Self {
        self.sg_entry_len = len;
        self
    }

    /// Explicit scatter entry lengths; must add up to the data length
    pub fn sgl(mut self, entries: Vec<usize>) -> Self {
        self.sgl = Some(entries);
        self
    }

    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn pr_res_key(mut self, key: u64) -> Self {
        self.pr_res_key = key;
        self
    }

    /// Mark this as a task management command
    pub fn tmr(mut self, function: TmrFunction) -> Self {
        self.tmr = Some(function);
        self
    }

    pub fn frontend_refs(mut self, refs: u32) -> Self {
        self.frontend_refs = refs;
        self
    }

    pub fn ack_ref(mut self, held: bool) -> Self {
        self.ack_ref = held;
        self
    }

    /// Build the command and register it with its session
    pub fn build(self) -> TargetResult<Arc<Command>> {
        if self.cdb.is_empty() && self.tmr.is_none() {
            return Err(TargetError::InvalidCommand("empty CDB".to_string()));
        }
        if let Some(len) = cdb::cdb_length(&self.cdb) {
            if self.cdb.len() < len {
                return Err(TargetError::InvalidCommand(format!(
                    "CDB for opcode {:#04x} is {} bytes, expected {}",
                    self.cdb[0],
                    self.cdb.len(),
                    len
                )));
            }
        }

        let class = CommandClass::classify(&self.cdb);
        let (lba, sectors) = match class {
            CommandClass::Read
            | CommandClass::Write
            | CommandClass::WriteSame
            | CommandClass::SynchronizeCache => (
                cdb::decode_lba(&self.cdb)?,
                cdb::decode_transfer_length(&self.cdb)?,
            ),
            CommandClass::CompareAndWrite => {
                (BigEndian::read_u64(&self.cdb[2..10]), self.cdb[13] as u32)
            }
            _ => (0, 0),
        };
        let fua = class == CommandClass::Write && cdb::fua(&self.cdb);

        let (data, direction) = match (self.data, self.data_length) {
            (Some(data), _) => (data, DataDirection::ToDevice),
            (None, Some(len)) if len > 0 => (vec![0u8; len as usize], DataDirection::FromDevice),
            _ => (Vec::new(), DataDirection::None),
        };
        let data_length = data.len() as u32;

        let sgl = match self.sgl {
            Some(entries) => {
                if entries.iter().sum::<usize>() != data.len() {
                    return Err(TargetError::InvalidCommand(
                        "scatter list does not cover the data buffer".to_string(),
                    ));
                }
                entries
            }
            None => {
                if self.sg_entry_len == 0 {
                    return Err(TargetError::InvalidCommand(
                        "scatter entry length must be non-zero".to_string(),
                    ));
                }
                let mut entries = Vec::new();
                let mut left = data.len();
                while left > 0 {
                    let len = left.min(self.sg_entry_len);
                    entries.push(len);
                    left -= len;
                }
                entries
            }
        };

        let refs = if self.ack_ref { 2 } else { 1 };
        let cmd = Arc::new(Command {
            tag: self.tag,
            cdb: self.cdb,
            lba,
            sectors,
            data_length,
            direction,
            fua,
            pr_res_key: self.pr_res_key,
            tmr: self.tmr,
            data: Mutex::new(data),
            sgl,
            device: self.device,
            lun: self.lun,
            session: self.session,
            frontend_refs: AtomicU32::new(self.frontend_refs),
            refs: AtomicU32::new(refs),
            ack_ref: AtomicBool::new(self.ack_ref),
            state: Mutex::new(CommandState::default()),
            settled: Condvar::new(),
        });

        if let Some(session) = &cmd.session {
            session.add_cmd(Arc::clone(&cmd));
        }
        Ok(cmd)
    }
}
