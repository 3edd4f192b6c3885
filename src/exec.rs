//! Backend execution of I/O commands
//!
//! READ/WRITE are split into segments over the command's scatter list.
//! WRITE SAME, UNMAP, COMPARE AND WRITE and SYNCHRONIZE CACHE are delegated
//! to the backend's optional primitives and fail with UNSUPPORTED SCSI
//! OPCODE when the primitive is missing.
//!
//! Each executor returns `Err` only before any backend work has been
//! started; from then on failures travel through the task's completion
//! tokens.

use crate::cdb::{self, CommandClass};
use crate::command::Command;
use crate::sense::SenseReason;
use crate::task::{native_sector, IoCompletion, Segment, SegmentOp, Task, TaskKind};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, warn};
use std::sync::Arc;

/// Segments collected before a submission batch is forced
pub const MAX_SEGMENTS_PER_BATCH: usize = 32;

/// UNMAP parameter list header length
const UNMAP_HEADER_LEN: usize = 8;
/// UNMAP block descriptor length
const UNMAP_DESC_LEN: usize = 16;

/// Run an I/O command against its device's backend
///
/// The command is completed here on early failure, otherwise by the last
/// backend completion.
pub fn execute_io(cmd: &Arc<Command>, class: CommandClass, batch_limit: usize) {
    let result = match class {
        CommandClass::Read => execute_transfer(cmd, false, batch_limit),
        CommandClass::Write => execute_transfer(cmd, true, batch_limit),
        CommandClass::WriteSame => execute_write_same(cmd),
        CommandClass::Unmap => execute_unmap(cmd),
        CommandClass::CompareAndWrite => execute_compare_and_write(cmd),
        CommandClass::SynchronizeCache => execute_sync_cache(cmd),
        _ => Err(SenseReason::UnsupportedScsiOpcode),
    };
    if let Err(reason) = result {
        cmd.complete(Err(reason));
    }
}

fn submit_batch(task: &Arc<Task>, cmd: &Command, ready: &mut Vec<Segment>) {
    let backend = cmd.device().backend();
    for segment in ready.drain(..) {
        debug!("submitting {:?}", segment);
        backend.submit(segment, task.segment());
    }
}

/// Split a READ or WRITE over backend segments
pub(crate) fn execute_transfer(
    cmd: &Arc<Command>,
    write: bool,
    batch_limit: usize,
) -> Result<(), SenseReason> {
    let dev = cmd.device();
    let attrs = dev.attrs();
    let mut sector = native_sector(cmd.lba(), attrs.block_size)?;

    if cmd.data_length() == 0 {
        cmd.complete(Ok(()));
        return Ok(());
    }

    // Force data to stable storage if we pretend to have no volatile write
    // cache, or the initiator asked for FUA and we honour it.
    let op = if !write {
        SegmentOp::Read
    } else if !attrs.emulate_write_cache || (attrs.emulate_fua_write && cmd.fua()) {
        SegmentOp::WriteFua
    } else {
        SegmentOp::Write
    };

    let limits = dev.backend().io_limits();
    let batch_limit = batch_limit.max(1);
    let (task, submitter) = Task::start(Arc::clone(cmd), TaskKind::Transfer);

    let mut ready = Vec::new();
    let mut segment = Segment::new(Arc::clone(cmd), sector, op);
    let mut offset = 0usize;

    for &len in cmd.sgl() {
        let full = segment.vecs > 0
            && (segment.vecs >= limits.max_segment_vecs
                || segment.len + len > limits.max_segment_bytes);
        if full {
            let mut next = Segment::new(Arc::clone(cmd), sector, op);
            next.offset = offset;
            ready.push(std::mem::replace(&mut segment, next));
            if ready.len() >= batch_limit {
                submit_batch(&task, cmd, &mut ready);
            }
        }
        segment.vecs += 1;
        segment.len += len;
        offset += len;
        // Always in 512 byte units for the backend
        sector += (len >> 9) as u64;
    }

    ready.push(segment);
    submit_batch(&task, cmd, &mut ready);
    submitter.complete(Ok(()));
    Ok(())
}

/// WRITE SAME (10/16/32)
pub(crate) fn execute_write_same(cmd: &Arc<Command>) -> Result<(), SenseReason> {
    let dev = cmd.device();
    let backend = dev.backend();
    let write_same = backend.write_same();
    let discard = backend.discard();

    if write_same.is_none() && discard.is_none() {
        error!("WRITE SAME emulation not supported for: {}", backend.name());
        return Err(SenseReason::UnsupportedScsiOpcode);
    }

    let lba = cmd.lba();
    // Explicit count when non-zero, otherwise everything up to the end
    let range = match cmd.sectors() {
        0 => (backend.last_lba() + 1).saturating_sub(lba),
        n => n as u64,
    };
    let unmap = cdb::write_same_unmap(cmd.cdb());
    debug!(
        "WRITE SAME: lba {} range {} unmap {} on {}",
        lba,
        range,
        unmap,
        dev.name()
    );

    if unmap && cmd.with_data(|data| data.iter().take(512).any(|&b| b != 0)) {
        warn!(
            "initiator {} did WRITE SAME ({:02x}h) with UNMAP but non-zero data",
            cmd.initiator_name().unwrap_or("<none>"),
            cmd.opcode()
        );
    }

    if let Some(write_same) = write_same {
        let sector = native_sector(lba, dev.attrs().block_size)?;
        let vecs = cmd.sgl().len();
        if vecs > backend.io_limits().max_segment_vecs {
            error!("WRITE SAME buffer spans more than one segment");
            return Err(SenseReason::LogicalUnitCommunicationFailure);
        }
        let (task, submitter) = Task::start(Arc::clone(cmd), TaskKind::WriteSame);
        let mut segment = Segment::new(Arc::clone(cmd), sector, SegmentOp::Write);
        segment.len = cmd.data_length() as usize;
        segment.vecs = vecs;
        write_same.write_same(segment, lba, range, task.segment());
        submitter.complete(Ok(()));
        return Ok(());
    }

    match discard {
        Some(discard) if unmap => {
            discard.discard(lba, range).map_err(|e| {
                error!("discard failed for WRITE SAME: {}", e);
                e.sense_reason()
            })?;
            cmd.complete(Ok(()));
            Ok(())
        }
        _ => Err(SenseReason::UnsupportedScsiOpcode),
    }
}

/// One UNMAP block descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnmapDescriptor {
    lba: u64,
    range: u32,
}

/// UNMAP
///
/// All descriptors are validated before anything is issued, so a bad
/// descriptor never leaves earlier ones half applied.
pub(crate) fn execute_unmap(cmd: &Arc<Command>) -> Result<(), SenseReason> {
    let dev = cmd.device();
    let attrs = dev.attrs();
    let backend = dev.backend();
    let write_same = backend.write_same();
    let discard = backend.discard();

    if write_same.is_none() && discard.is_none() {
        error!("UNMAP emulation not supported for: {}", backend.name());
        return Err(SenseReason::UnsupportedScsiOpcode);
    }

    let buf = cmd.data();
    if buf.is_empty() {
        cmd.complete(Ok(()));
        return Ok(());
    }
    if buf.len() < UNMAP_HEADER_LEN {
        return Err(SenseReason::InvalidParameterList);
    }

    let dl = BigEndian::read_u16(&buf[0..2]);
    let bd_dl = BigEndian::read_u16(&buf[2..4]);
    let size = (buf.len() - UNMAP_HEADER_LEN).min(bd_dl as usize);
    debug!(
        "UNMAP: {} using dl: {} bd_dl: {} size: {}",
        backend.name(),
        dl,
        bd_dl,
        size
    );

    if size / UNMAP_DESC_LEN > attrs.max_unmap_block_desc_count as usize {
        return Err(SenseReason::InvalidParameterList);
    }

    let capacity = backend.last_lba().saturating_add(1);
    let descriptors: Vec<UnmapDescriptor> = buf[UNMAP_HEADER_LEN..UNMAP_HEADER_LEN + size]
        .chunks_exact(UNMAP_DESC_LEN)
        .map(|desc| UnmapDescriptor {
            lba: BigEndian::read_u64(&desc[0..8]),
            range: BigEndian::read_u32(&desc[8..12]),
        })
        .collect();

    for desc in &descriptors {
        debug!("UNMAP: lba {} range {}", desc.lba, desc.range);
        if desc.range > attrs.max_unmap_lba_count {
            return Err(SenseReason::InvalidParameterList);
        }
        match desc.lba.checked_add(desc.range as u64) {
            Some(end) if end <= capacity => {}
            _ => return Err(SenseReason::AddressOutOfRange),
        }
    }

    if let Some(write_same) = write_same {
        // The zero block replaces the data-out buffer, so only a single
        // descriptor can be carried this way.
        if size > 2 * UNMAP_DESC_LEN - 1 {
            error!("too many UNMAP descriptors for write same offload");
            return Err(SenseReason::InvalidCdbField);
        }
        let Some(desc) = descriptors.first().copied() else {
            cmd.complete(Ok(()));
            return Ok(());
        };
        let sector = native_sector(desc.lba, attrs.block_size)?;
        let block_size = attrs.block_size as usize;
        cmd.replace_data(vec![0u8; block_size]);

        let (task, submitter) = Task::start(Arc::clone(cmd), TaskKind::WriteSame);
        let mut segment = Segment::new(Arc::clone(cmd), sector, SegmentOp::Write);
        segment.len = block_size;
        segment.vecs = 1;
        write_same.write_same(segment, desc.lba, desc.range as u64, task.segment());
        submitter.complete(Ok(()));
        return Ok(());
    }

    if let Some(discard) = discard {
        for desc in descriptors {
            if let Err(e) = discard.discard(desc.lba, desc.range as u64) {
                error!("discard of lba {} range {} failed: {}", desc.lba, desc.range, e);
                return Err(SenseReason::LogicalUnitCommunicationFailure);
            }
        }
    }
    cmd.complete(Ok(()));
    Ok(())
}

/// COMPARE AND WRITE
pub(crate) fn execute_compare_and_write(cmd: &Arc<Command>) -> Result<(), SenseReason> {
    let dev = cmd.device();
    let backend = dev.backend();
    let Some(caw) = backend.compare_and_write() else {
        error!("COMPARE AND WRITE emulation not supported for: {}", backend.name());
        return Err(SenseReason::UnsupportedScsiOpcode);
    };

    let range = cmd.cdb()[13] as u32;
    let sector = native_sector(cmd.lba(), dev.attrs().block_size)?;
    let vecs = cmd.sgl().len();
    if vecs > backend.io_limits().max_segment_vecs {
        error!("COMPARE AND WRITE buffer spans more than one segment");
        return Err(SenseReason::LogicalUnitCommunicationFailure);
    }

    let (task, submitter) = Task::start(Arc::clone(cmd), TaskKind::CompareAndWrite);
    task.expect_compare(cmd.data_length());
    let mut segment = Segment::new(Arc::clone(cmd), sector, SegmentOp::Write);
    segment.len = cmd.data_length() as usize;
    segment.vecs = vecs;
    debug!("submitting compare and write {:?} range {}", segment, range);
    caw.compare_and_write(segment, range, task.segment());
    submitter.complete(Ok(()));
    Ok(())
}

/// SYNCHRONIZE CACHE (10/16)
///
/// The whole cache is always flushed; the LBA range is ignored.
pub(crate) fn execute_sync_cache(cmd: &Arc<Command>) -> Result<(), SenseReason> {
    let backend = cmd.device().backend();
    let Some(sync) = backend.sync_cache() else {
        error!("SYNCHRONIZE CACHE emulation not supported for: {}", backend.name());
        return Err(SenseReason::UnsupportedScsiOpcode);
    };

    let immed = cmd.cdb()[1] & 0x02 != 0;
    if immed {
        cmd.complete(Ok(()));
        sync.sync_cache(IoCompletion::detached(cmd.tag(), "SYNCHRONIZE CACHE"));
    } else {
        let (task, submitter) = Task::start(Arc::clone(cmd), TaskKind::SyncCache);
        sync.sync_cache(task.segment());
        submitter.complete(Ok(()));
    }
    Ok(())
}
