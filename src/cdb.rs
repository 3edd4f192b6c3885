//! CDB opcodes and field decoders
//!
//! All multi-byte CDB fields are big-endian. Decoders take the raw CDB slice
//! and fail with [`SenseReason::InvalidCdbField`] when it is too short for
//! the field being read.

use crate::sense::SenseReason;
use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes understood by the core
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Read6 = 0x08,
    Write6 = 0x0A,
    Inquiry = 0x12,
    ModeSelect6 = 0x15,
    ModeSense6 = 0x1A,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    SynchronizeCache10 = 0x35,
    WriteSame10 = 0x41,
    Unmap = 0x42,
    ModeSelect10 = 0x55,
    ModeSense10 = 0x5A,
    VariableLength = 0x7F, // WRITE SAME 32 uses this
    Read16 = 0x88,
    CompareAndWrite = 0x89,
    Write16 = 0x8A,
    SynchronizeCache16 = 0x91,
    WriteSame16 = 0x93,
    ServiceActionIn16 = 0x9E, // READ CAPACITY 16 uses this
    Read12 = 0xA8,
    Write12 = 0xAA,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x03 => Some(ScsiOpcode::RequestSense),
            0x08 => Some(ScsiOpcode::Read6),
            0x0A => Some(ScsiOpcode::Write6),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x15 => Some(ScsiOpcode::ModeSelect6),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x35 => Some(ScsiOpcode::SynchronizeCache10),
            0x41 => Some(ScsiOpcode::WriteSame10),
            0x42 => Some(ScsiOpcode::Unmap),
            0x55 => Some(ScsiOpcode::ModeSelect10),
            0x5A => Some(ScsiOpcode::ModeSense10),
            0x7F => Some(ScsiOpcode::VariableLength),
            0x88 => Some(ScsiOpcode::Read16),
            0x89 => Some(ScsiOpcode::CompareAndWrite),
            0x8A => Some(ScsiOpcode::Write16),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x93 => Some(ScsiOpcode::WriteSame16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            0xA8 => Some(ScsiOpcode::Read12),
            0xAA => Some(ScsiOpcode::Write12),
            _ => None,
        }
    }
}

/// Service action of WRITE SAME (32) inside a variable length CDB
pub const WRITE_SAME_32_SA: u16 = 0x000D;
/// Service action of READ CAPACITY (16) inside SERVICE ACTION IN (16)
pub const READ_CAPACITY_16_SA: u8 = 0x10;

/// Data transfer direction of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
}

/// How the core handles a given CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Response synthesized by the core without touching the backend
    Emulated,
    TestUnitReady,
    Read,
    Write,
    WriteSame,
    Unmap,
    CompareAndWrite,
    SynchronizeCache,
    Unsupported,
}

impl CommandClass {
    pub fn classify(cdb: &[u8]) -> Self {
        let Some(&op) = cdb.first() else {
            return CommandClass::Unsupported;
        };
        match ScsiOpcode::from_u8(op) {
            Some(ScsiOpcode::TestUnitReady) => CommandClass::TestUnitReady,
            Some(
                ScsiOpcode::Inquiry
                | ScsiOpcode::RequestSense
                | ScsiOpcode::ModeSense6
                | ScsiOpcode::ModeSense10
                | ScsiOpcode::ModeSelect6
                | ScsiOpcode::ModeSelect10
                | ScsiOpcode::ReadCapacity10,
            ) => CommandClass::Emulated,
            Some(ScsiOpcode::ServiceActionIn16) => {
                if cdb.len() > 1 && cdb[1] & 0x1F == READ_CAPACITY_16_SA {
                    CommandClass::Emulated
                } else {
                    CommandClass::Unsupported
                }
            }
            Some(ScsiOpcode::Read6 | ScsiOpcode::Read10 | ScsiOpcode::Read12 | ScsiOpcode::Read16) => {
                CommandClass::Read
            }
            Some(
                ScsiOpcode::Write6 | ScsiOpcode::Write10 | ScsiOpcode::Write12 | ScsiOpcode::Write16,
            ) => CommandClass::Write,
            Some(ScsiOpcode::WriteSame10 | ScsiOpcode::WriteSame16) => CommandClass::WriteSame,
            Some(ScsiOpcode::VariableLength) => {
                if cdb.len() >= 10 && BigEndian::read_u16(&cdb[8..10]) == WRITE_SAME_32_SA {
                    CommandClass::WriteSame
                } else {
                    CommandClass::Unsupported
                }
            }
            Some(ScsiOpcode::Unmap) => CommandClass::Unmap,
            Some(ScsiOpcode::CompareAndWrite) => CommandClass::CompareAndWrite,
            Some(ScsiOpcode::SynchronizeCache10 | ScsiOpcode::SynchronizeCache16) => {
                CommandClass::SynchronizeCache
            }
            None => CommandClass::Unsupported,
        }
    }

    pub fn direction(&self) -> DataDirection {
        match self {
            CommandClass::Read => DataDirection::FromDevice,
            CommandClass::Write
            | CommandClass::WriteSame
            | CommandClass::Unmap
            | CommandClass::CompareAndWrite => DataDirection::ToDevice,
            _ => DataDirection::None,
        }
    }
}

/// CDB length implied by the opcode's group code
///
/// Variable length CDBs (7Fh) carry their additional length in byte 7, so
/// this needs the whole CDB rather than just the opcode.
pub fn cdb_length(cdb: &[u8]) -> Option<usize> {
    let op = *cdb.first()?;
    match op >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        3 if op == ScsiOpcode::VariableLength as u8 => cdb.get(7).map(|&add| 8 + add as usize),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}

fn need(cdb: &[u8], len: usize) -> Result<(), SenseReason> {
    if cdb.len() < len {
        Err(SenseReason::InvalidCdbField)
    } else {
        Ok(())
    }
}

/// Logical block address carried by a READ/WRITE style CDB
pub fn decode_lba(cdb: &[u8]) -> Result<u64, SenseReason> {
    match cdb_length(cdb) {
        Some(6) => {
            need(cdb, 6)?;
            Ok((((cdb[1] & 0x1F) as u64) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64)
        }
        Some(10) | Some(12) => {
            need(cdb, 10)?;
            Ok(BigEndian::read_u32(&cdb[2..6]) as u64)
        }
        Some(16) => {
            need(cdb, 16)?;
            Ok(BigEndian::read_u64(&cdb[2..10]))
        }
        Some(32) => {
            need(cdb, 32)?;
            Ok(BigEndian::read_u64(&cdb[12..20]))
        }
        _ => Err(SenseReason::InvalidCdbField),
    }
}

/// Transfer length (in logical blocks) carried by a READ/WRITE style CDB
///
/// A zero length in READ(6)/WRITE(6) means 256 blocks.
pub fn decode_transfer_length(cdb: &[u8]) -> Result<u32, SenseReason> {
    match cdb_length(cdb) {
        Some(6) => {
            need(cdb, 6)?;
            match cdb[4] {
                0 if cdb[0] == ScsiOpcode::Read6 as u8 || cdb[0] == ScsiOpcode::Write6 as u8 => {
                    Ok(256)
                }
                len => Ok(len as u32),
            }
        }
        Some(10) => {
            need(cdb, 10)?;
            Ok(BigEndian::read_u16(&cdb[7..9]) as u32)
        }
        Some(12) => {
            need(cdb, 12)?;
            Ok(BigEndian::read_u32(&cdb[6..10]))
        }
        Some(16) => {
            need(cdb, 16)?;
            Ok(BigEndian::read_u32(&cdb[10..14]))
        }
        Some(32) => {
            need(cdb, 32)?;
            Ok(BigEndian::read_u32(&cdb[28..32]))
        }
        _ => Err(SenseReason::InvalidCdbField),
    }
}

/// FUA bit of a READ/WRITE (10/12/16) CDB
pub fn fua(cdb: &[u8]) -> bool {
    match cdb_length(cdb) {
        Some(10) | Some(12) | Some(16) => cdb.get(1).map_or(false, |b| b & 0x08 != 0),
        _ => false,
    }
}

/// UNMAP bit of a WRITE SAME (10/16/32) CDB
pub fn write_same_unmap(cdb: &[u8]) -> bool {
    let flags = if cdb.first() == Some(&(ScsiOpcode::VariableLength as u8)) {
        cdb.get(10)
    } else {
        cdb.get(1)
    };
    flags.map_or(false, |b| b & 0x08 != 0)
}

/// Allocation length of an emulated CDB that returns data to the initiator
pub fn allocation_length(cdb: &[u8]) -> usize {
    match cdb.first().and_then(|&op| ScsiOpcode::from_u8(op)) {
        Some(ScsiOpcode::Inquiry) if cdb.len() >= 5 => BigEndian::read_u16(&cdb[3..5]) as usize,
        Some(ScsiOpcode::RequestSense | ScsiOpcode::ModeSense6 | ScsiOpcode::ModeSelect6)
            if cdb.len() >= 5 =>
        {
            cdb[4] as usize
        }
        Some(ScsiOpcode::ModeSense10 | ScsiOpcode::ModeSelect10) if cdb.len() >= 9 => {
            BigEndian::read_u16(&cdb[7..9]) as usize
        }
        Some(ScsiOpcode::Unmap) if cdb.len() >= 9 => BigEndian::read_u16(&cdb[7..9]) as usize,
        Some(ScsiOpcode::ReadCapacity10) => 8,
        Some(ScsiOpcode::ServiceActionIn16) if cdb.len() >= 14 => {
            BigEndian::read_u32(&cdb[10..14]) as usize
        }
        _ => 0,
    }
}

/// Rewrite the LBA and transfer length fields of `cdb` in place so it covers
/// only `sectors` blocks starting at `lba`
///
/// Used when one command is carried out as several backend tasks, each of
/// which needs its own CDB.
pub fn rewrite_task_cdb(cdb: &mut [u8], lba: u64, sectors: u32) -> Result<(), SenseReason> {
    match cdb_length(cdb) {
        Some(6) => {
            need(cdb, 6)?;
            if lba > 0x1F_FFFF || sectors > 256 {
                return Err(SenseReason::InvalidCdbField);
            }
            cdb[1] = (cdb[1] & 0xE0) | ((lba >> 16) as u8 & 0x1F);
            cdb[2] = (lba >> 8) as u8;
            cdb[3] = lba as u8;
            // 256 blocks is encoded as zero
            cdb[4] = sectors as u8;
        }
        Some(10) => {
            need(cdb, 10)?;
            let lba = u32::try_from(lba).map_err(|_| SenseReason::InvalidCdbField)?;
            let sectors = u16::try_from(sectors).map_err(|_| SenseReason::InvalidCdbField)?;
            BigEndian::write_u32(&mut cdb[2..6], lba);
            BigEndian::write_u16(&mut cdb[7..9], sectors);
        }
        Some(12) => {
            need(cdb, 12)?;
            let lba = u32::try_from(lba).map_err(|_| SenseReason::InvalidCdbField)?;
            BigEndian::write_u32(&mut cdb[2..6], lba);
            BigEndian::write_u32(&mut cdb[6..10], sectors);
        }
        Some(16) => {
            need(cdb, 16)?;
            BigEndian::write_u64(&mut cdb[2..10], lba);
            BigEndian::write_u32(&mut cdb[10..14], sectors);
        }
        Some(32) => {
            need(cdb, 32)?;
            BigEndian::write_u64(&mut cdb[12..20], lba);
            BigEndian::write_u32(&mut cdb[28..32], sectors);
        }
        _ => return Err(SenseReason::InvalidCdbField),
    }
    Ok(())
}
