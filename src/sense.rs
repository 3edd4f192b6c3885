//! SCSI status codes, sense data and the sense-reason taxonomy
//!
//! Emulation code never builds sense bytes directly. It fails with a
//! [`SenseReason`] and the command turns that into a status byte plus
//! fixed-format sense data when it completes.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const LOGICAL_UNIT_COMMUNICATION_FAILURE: u8 = 0x08;
    pub const MISCOMPARE_DURING_VERIFY: u8 = 0x1D;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const INVALID_FIELD_IN_PARAMETER_LIST: u8 = 0x26;
    pub const POWER_ON_RESET: u8 = 0x29;
}

/// Byte offsets inside fixed-format sense data
pub const SENSE_KEY_OFFSET: usize = 2;
pub const SENSE_INFO_OFFSET: usize = 3;
pub const SENSE_ADD_LEN_OFFSET: usize = 7;
pub const SENSE_ASC_OFFSET: usize = 12;
pub const SENSE_ASCQ_OFFSET: usize = 13;

/// Length of fixed-format sense data
pub const FIXED_SENSE_LEN: usize = 18;

/// Why a command failed
///
/// Each variant maps onto one status byte and, except for
/// [`SenseReason::ReservationConflict`], one sense triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SenseReason {
    #[error("invalid field in CDB")]
    InvalidCdbField,

    #[error("unknown mode page")]
    UnknownModePage,

    #[error("unsupported SCSI opcode")]
    UnsupportedScsiOpcode,

    #[error("invalid field in parameter list")]
    InvalidParameterList,

    #[error("logical block address out of range")]
    AddressOutOfRange,

    #[error("miscompare during verify at byte offset {offset}")]
    MiscompareDuringVerify { offset: u32 },

    #[error("reservation conflict")]
    ReservationConflict,

    #[error("logical unit communication failure")]
    LogicalUnitCommunicationFailure,
}

impl SenseReason {
    /// SCSI status byte reported for this reason
    pub fn status(&self) -> u8 {
        match self {
            SenseReason::ReservationConflict => scsi_status::RESERVATION_CONFLICT,
            _ => scsi_status::CHECK_CONDITION,
        }
    }

    /// Sense data carried alongside the status, if any
    pub fn sense_data(&self) -> Option<SenseData> {
        let sense = match *self {
            SenseReason::InvalidCdbField | SenseReason::UnknownModePage => {
                SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
            }
            SenseReason::UnsupportedScsiOpcode => SenseData::new(
                sense_key::ILLEGAL_REQUEST,
                asc::INVALID_COMMAND_OPERATION_CODE,
                0,
            ),
            SenseReason::InvalidParameterList => SenseData::new(
                sense_key::ILLEGAL_REQUEST,
                asc::INVALID_FIELD_IN_PARAMETER_LIST,
                0,
            ),
            SenseReason::AddressOutOfRange => {
                SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0)
            }
            SenseReason::MiscompareDuringVerify { offset } => {
                SenseData::new(sense_key::MISCOMPARE, asc::MISCOMPARE_DURING_VERIFY, 0)
                    .with_info(offset)
            }
            SenseReason::ReservationConflict => return None,
            SenseReason::LogicalUnitCommunicationFailure => SenseData::new(
                sense_key::NOT_READY,
                asc::LOGICAL_UNIT_COMMUNICATION_FAILURE,
                0,
            ),
        };
        Some(sense)
    }
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
    /// INFORMATION field; sets the VALID bit when present
    pub information: Option<u32>,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: None,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = Some(info);
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; FIXED_SENSE_LEN];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[SENSE_KEY_OFFSET] = self.sense_key & 0x0F;

        if let Some(info) = self.information {
            data[0] |= 0x80;
            BigEndian::write_u32(&mut data[SENSE_INFO_OFFSET..SENSE_INFO_OFFSET + 4], info);
        }

        // Remaining bytes after this field
        data[SENSE_ADD_LEN_OFFSET] = 10;
        data[SENSE_ASC_OFFSET] = self.asc;
        data[SENSE_ASCQ_OFFSET] = self.ascq;

        data
    }
}
