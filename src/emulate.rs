//! Emulated SCSI commands
//!
//! INQUIRY, MODE SENSE/SELECT, REQUEST SENSE and READ CAPACITY are answered
//! by the core without touching the backend. Responses are built into a
//! scratch buffer and then copied into the command's data buffer, truncated
//! to the allocation length.

use crate::buffer::{ResponseBuf, SCRATCH_BUF_LEN};
use crate::cdb::{self, DataDirection, ScsiOpcode, READ_CAPACITY_16_SA};
use crate::command::Command;
use crate::device::{TYPE_DISK, TYPE_NO_LUN, TYPE_TAPE};
use crate::pages::{ModePage, VpdPage};
use crate::sense::{sense_key, SenseReason, FIXED_SENSE_LEN};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error};

/// Length of the standard INQUIRY response
pub const INQUIRY_STD_LEN: usize = 96;

/// Offset of the version descriptors in standard INQUIRY data
const VERSION_DESCRIPTOR_OFFSET: usize = 58;

/// The obsolete format device page, rejected without logging
const MODE_PAGE_FORMAT_DEVICE: u8 = 0x03;

/// Mode page code selecting every page
const MODE_PAGE_ALL: u8 = 0x3f;

/// Run an emulated command and fill its data-in buffer
pub fn emulate(cmd: &Command) -> Result<(), SenseReason> {
    let mut scratch = [0u8; SCRATCH_BUF_LEN];
    let mut out = ResponseBuf::new(&mut scratch);

    let len = match ScsiOpcode::from_u8(cmd.opcode()) {
        Some(ScsiOpcode::Inquiry) => inquiry(cmd, &mut out)?,
        Some(ScsiOpcode::ModeSense6 | ScsiOpcode::ModeSense10) => mode_sense(cmd, &mut out)?,
        Some(ScsiOpcode::ModeSelect6 | ScsiOpcode::ModeSelect10) => mode_select(cmd)?,
        Some(ScsiOpcode::RequestSense) => request_sense(cmd, &mut out)?,
        Some(ScsiOpcode::ReadCapacity10) => read_capacity(cmd, &mut out)?,
        Some(ScsiOpcode::ServiceActionIn16)
            if cmd.cdb().get(1).map(|b| b & 0x1f) == Some(READ_CAPACITY_16_SA) =>
        {
            read_capacity_16(cmd, &mut out)?
        }
        _ => return Err(SenseReason::UnsupportedScsiOpcode),
    };

    let response = out.as_slice();
    let len = len.min(response.len()).min(cdb::allocation_length(cmd.cdb()));
    if cmd.direction() == DataDirection::FromDevice {
        cmd.fill_response(&response[..len]);
    }
    Ok(())
}

/// INQUIRY, standard data or a VPD page
pub fn inquiry(cmd: &Command, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    let cdb = cmd.cdb();
    let evpd = cdb[1] & 0x01 != 0;
    let page_code = cdb[2];

    if !evpd {
        if page_code != 0 {
            error!("INQUIRY with EVPD==0 but PAGE CODE={:#04x}", page_code);
            return Err(SenseReason::InvalidCdbField);
        }
        return inquiry_std(cmd, out);
    }

    let Some(page) = VpdPage::from_code(page_code) else {
        error!("Unknown VPD Code: {:#04x}", page_code);
        return Err(SenseReason::InvalidCdbField);
    };
    inquiry_vpd(cmd, page, out)
}

fn peripheral_type(cmd: &Command) -> u8 {
    if cmd.lun().virtual_lun0 {
        TYPE_NO_LUN
    } else {
        cmd.device().backend().device_type()
    }
}

/// Standard INQUIRY data
pub fn inquiry_std(cmd: &Command, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    let dev = cmd.device();
    let attrs = dev.attrs();
    let backend = dev.backend();

    let hdr = out.reserve(8)?;
    hdr[0] = peripheral_type(cmd);
    if backend.device_type() == TYPE_TAPE {
        hdr[1] = 0x80; // RMB
    }
    hdr[2] = backend.device_rev(); // version
    hdr[3] = 0x02; // response data format

    // Asymmetric access state comes from the port's target port group
    if attrs.emulate_alua {
        let access = cmd
            .lun()
            .port
            .as_ref()
            .and_then(|port| port.tg_pt_gp.current())
            .map_or(0, |tg_pt_gp| tg_pt_gp.access_type);
        hdr[5] = 0x80 | access; // SCCS + TPGS
    }
    hdr[6] = 0x10; // MultiP
    hdr[7] = 0x02; // CmdQue

    out.put_padded(attrs.wwn.vendor.as_bytes(), 8, b' ')?;
    out.put_padded(attrs.wwn.model.as_bytes(), 16, b' ')?;
    out.put_padded(attrs.wwn.revision.as_bytes(), 4, b' ')?;

    out.skip(VERSION_DESCRIPTOR_OFFSET - out.pos())?;
    out.put_u16(0x0080)?; // SAM-2
    if let Some(desc) = cmd.lun().port.as_ref().and_then(|p| p.fabric_vers_desc) {
        out.put_u16(desc)?;
    }
    out.put_u16(0x0460)?; // SPC-4
    out.put_u16(0x04C0)?; // SBC-3

    out.skip(INQUIRY_STD_LEN - out.pos())?;
    out.set_u8(4, (INQUIRY_STD_LEN - 5) as u8)?; // additional length
    Ok(INQUIRY_STD_LEN)
}

/// One VPD page with its 4-byte header
pub fn inquiry_vpd(cmd: &Command, page: VpdPage, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    let hdr = out.reserve(4)?;
    hdr[0] = if page.reports_device_type() {
        cmd.device().backend().device_type()
    } else {
        peripheral_type(cmd)
    };
    hdr[1] = page.code();

    page.fill(cmd, out)?;

    let page_len = out.pos() - 4;
    out.set_u16(2, page_len as u16)?;
    debug!("VPD page {:#04x}: {} bytes", page.code(), page_len);
    Ok(out.pos())
}

/// MODE SENSE (6) and (10)
pub fn mode_sense(cmd: &Command, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    let cdb = cmd.cdb();
    let ten = cdb[0] == ScsiOpcode::ModeSense10 as u8;
    let dbd = cdb[1] & 0x08 != 0;
    let llbaa = ten && cdb[1] & 0x10 != 0;
    let pc = cdb[2] >> 6;
    let page = cdb[2] & 0x3f;
    let subpage = cdb[3];

    let dev = cmd.device();
    let attrs = dev.attrs();

    let hdr_len = if ten { 8 } else { 4 };
    out.skip(hdr_len)?;

    // Device specific parameter
    let mut dsp = 0u8;
    let acl_read_only = cmd.session().map_or(false, |s| s.read_only());
    if cmd.lun().read_only || acl_read_only {
        dsp |= 0x80; // WP
    }
    if attrs.emulate_write_cache
        && attrs.emulate_fua_write
        && dev.backend().device_type() == TYPE_DISK
    {
        dsp |= 0x10; // DPOFUA
    }
    out.set_u8(if ten { 3 } else { 2 }, dsp)?;

    if !dbd {
        let blocks = dev.backend().last_lba();
        if llbaa && blocks > u32::MAX as u64 {
            out.set_u8(4, 0x01)?; // LONGLBA
            out.set_u8(7, 16)?; // block descriptor length
            out.put_u64(blocks)?;
            out.skip(4)?;
            out.put_u32(attrs.block_size)?;
        } else {
            out.set_u8(hdr_len - 1, 8)?; // block descriptor length
            out.put_u32(blocks.min(u32::MAX as u64) as u32)?;
            out.put_u32(attrs.block_size)?;
        }
    }

    if page == MODE_PAGE_ALL {
        if subpage != 0x00 && subpage != 0xff {
            error!("MODE SENSE: invalid subpage code for PAGE_CODE=0x3f: {:#04x}", subpage);
            return Err(SenseReason::InvalidCdbField);
        }
        for mp in ModePage::wildcard(subpage) {
            let mark = out.pos();
            mp.fill(dev, pc, out)?;
            // The 6-byte header only has a one byte length
            if !ten && out.pos() >= 255 {
                out.rewind(mark);
                break;
            }
        }
    } else {
        let Some(mp) = ModePage::find(page, subpage) else {
            if page != MODE_PAGE_FORMAT_DEVICE {
                error!(
                    "MODE SENSE: unimplemented page/subpage: {:#04x}/{:#04x}",
                    page, subpage
                );
            }
            return Err(SenseReason::UnknownModePage);
        };
        mp.fill(dev, pc, out)?;
    }

    let len = out.pos();
    if ten {
        out.set_u16(0, (len - 2) as u16)?;
    } else {
        out.set_u8(0, (len - 1) as u8)?;
    }
    Ok(len)
}

/// MODE SELECT (6) and (10)
///
/// Nothing is changeable: the parameter list is accepted only if it repeats
/// the current values of the page byte for byte.
pub fn mode_select(cmd: &Command) -> Result<usize, SenseReason> {
    let cdb = cmd.cdb();
    let ten = cdb[0] == ScsiOpcode::ModeSelect10 as u8;
    if cdb[1] & 0x10 == 0 {
        error!("MODE SELECT without PF is not supported");
        return Err(SenseReason::InvalidCdbField);
    }

    let data = cmd.data();
    if data.is_empty() {
        return Ok(0);
    }
    let off = if ten { 8 } else { 4 };
    if data.len() < off + 2 {
        return Err(SenseReason::InvalidCdbField);
    }

    let page = data[off] & 0x3f;
    let subpage = if data[off] & 0x40 != 0 { data[off + 1] } else { 0 };
    let mp = ModePage::find(page, subpage).ok_or(SenseReason::UnknownModePage)?;

    let mut scratch = [0u8; SCRATCH_BUF_LEN];
    let mut current = ResponseBuf::new(&mut scratch);
    let len = mp.fill(cmd.device(), 0, &mut current)?;

    match data.get(off..off + len) {
        Some(supplied) if supplied == current.as_slice() => Ok(0),
        _ => {
            debug!("MODE SELECT: page {:#04x} differs from current values", page);
            Err(SenseReason::InvalidCdbField)
        }
    }
}

/// REQUEST SENSE, reporting and clearing a pending unit attention
pub fn request_sense(cmd: &Command, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    if cmd.cdb()[1] & 0x01 != 0 {
        error!("REQUEST_SENSE description emulation not supported");
        return Err(SenseReason::InvalidCdbField);
    }

    let ua = cmd.session().and_then(|s| s.take_ua(cmd.lun().id));
    let short = (cmd.data_length() as usize) < FIXED_SENSE_LEN;

    let buf = out.reserve(FIXED_SENSE_LEN)?;
    buf[0] = 0x70; // current error
    match ua {
        Some((asc, ascq)) => {
            buf[2] = sense_key::UNIT_ATTENTION;
            if !short {
                buf[7] = 0x0A;
                buf[12] = asc;
                buf[13] = ascq;
            }
        }
        None => {
            buf[2] = sense_key::NO_SENSE;
            if !short {
                buf[7] = 0x0A;
            }
        }
    }
    Ok(FIXED_SENSE_LEN)
}

/// READ CAPACITY (10)
pub fn read_capacity(cmd: &Command, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    let cdb = cmd.cdb();
    let pmi = cdb[8] & 0x01 != 0;
    if !pmi && BigEndian::read_u32(&cdb[2..6]) != 0 {
        return Err(SenseReason::InvalidCdbField);
    }

    let dev = cmd.device();
    let last_lba = dev.backend().last_lba();
    out.put_u32(last_lba.min(u32::MAX as u64) as u32)?;
    out.put_u32(dev.attrs().block_size)?;
    Ok(8)
}

/// READ CAPACITY (16)
pub fn read_capacity_16(cmd: &Command, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
    let dev = cmd.device();
    let attrs = dev.attrs();

    out.put_u64(dev.backend().last_lba())?;
    out.put_u32(attrs.block_size)?;
    let rest = out.reserve(20)?;
    if attrs.thin_provisioning() {
        rest[2] = 0xC0; // LBPME, LBPRZ
    }
    Ok(32)
}
