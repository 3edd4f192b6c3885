//! VPD and mode page tables
//!
//! Pages are keyed by enum and listed in the order they are reported. Each
//! entry knows its code and fills its own body into a [`ResponseBuf`].

use crate::buffer::ResponseBuf;
use crate::command::Command;
use crate::device::Device;
use crate::sense::SenseReason;
use byteorder::{BigEndian, ByteOrder};
use log::debug;

/// IEEE company ID used for the NAA designator
pub const IEEE_COMPANY_ID: u32 = 0x001405;

/// Maximum write same length reported in the block limits page
const MAX_WRITE_SAME_LEN: u64 = 0x1000_0000;

/// Longest vendor specific volume name designator
const MAX_VOLUME_NAME_LEN: usize = 64;

/// Page control value asking for the changeable mask
pub const PC_CHANGEABLE: u8 = 1;

/// Vital product data pages
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VpdPage {
    SupportedPages,
    UnitSerial,
    DeviceIdentification,
    ExtendedInquiry,
    BlockLimits,
    BlockCharacteristics,
    ThinProvisioning,
}

impl VpdPage {
    /// Every supported page, in ascending page code order
    pub const ALL: &'static [Self] = &[
        Self::SupportedPages,
        Self::UnitSerial,
        Self::DeviceIdentification,
        Self::ExtendedInquiry,
        Self::BlockLimits,
        Self::BlockCharacteristics,
        Self::ThinProvisioning,
    ];

    pub const fn code(self) -> u8 {
        match self {
            Self::SupportedPages => 0x00,
            Self::UnitSerial => 0x80,
            Self::DeviceIdentification => 0x83,
            Self::ExtendedInquiry => 0x86,
            Self::BlockLimits => 0xb0,
            Self::BlockCharacteristics => 0xb1,
            Self::ThinProvisioning => 0xb2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|page| page.code() == code)
    }

    /// Block device pages always report the backend's device type, even
    /// through the virtual LUN 0
    pub const fn reports_device_type(self) -> bool {
        matches!(
            self,
            Self::BlockLimits | Self::BlockCharacteristics | Self::ThinProvisioning
        )
    }

    /// Write the page body that follows the 4-byte VPD header
    pub fn fill(self, cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
        match self {
            Self::SupportedPages => supported_pages(cmd, out),
            Self::UnitSerial => unit_serial(cmd, out),
            Self::DeviceIdentification => device_identification(cmd, out),
            Self::ExtendedInquiry => extended_inquiry(cmd, out),
            Self::BlockLimits => block_limits(cmd, out),
            Self::BlockCharacteristics => block_characteristics(cmd, out),
            Self::ThinProvisioning => thin_provisioning(cmd, out),
        }
    }
}

// The page list is only offered once the unit has an identity.
fn supported_pages(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    if cmd.device().attrs().wwn.unit_serial.is_none() {
        return Ok(());
    }
    for page in VpdPage::ALL {
        out.put_u8(page.code())?;
    }
    Ok(())
}

fn unit_serial(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    if let Some(serial) = &cmd.device().attrs().wwn.unit_serial {
        out.put_bytes(serial.as_bytes())?;
        out.put_u8(0)?;
    }
    Ok(())
}

/// Pack the hex digits of `serial` into `out`, high nibble first
///
/// Characters that are not hex digits are skipped and digits that do not
/// fit are dropped.
pub fn pack_serial_nibbles(serial: &str, out: &mut [u8]) {
    let mut digits: String = serial
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(out.len() * 2)
        .collect();
    if digits.len() % 2 == 1 {
        digits.push('0');
    }
    // Only hex digits made it through the filter
    if let Ok(bytes) = hex::decode(&digits) {
        out[..bytes.len()].copy_from_slice(&bytes);
    }
}

fn device_identification(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    let dev = cmd.device();
    let attrs = dev.attrs();
    let wwn = &attrs.wwn;

    // NAA IEEE Registered Extended designator
    if let Some(serial) = &wwn.unit_serial {
        out.put_bytes(&[0x01, 0x03, 0x00, 0x10])?;
        let naa = out.reserve(16)?;
        naa[0] = 0x60 | ((IEEE_COMPANY_ID >> 20) & 0x0f) as u8;
        naa[1] = (IEEE_COMPANY_ID >> 12) as u8;
        naa[2] = (IEEE_COMPANY_ID >> 4) as u8;
        naa[3] = ((IEEE_COMPANY_ID << 4) & 0xf0) as u8;
        pack_serial_nibbles(serial, &mut naa[4..]);
        debug!("{}: NAA designator {}", dev.name(), hex::encode(&*naa));
    }

    // T10 vendor identification
    let mut t10 = padded(&wwn.vendor, 8);
    if let Some(serial) = &wwn.unit_serial {
        t10.extend_from_slice(wwn.model.trim_end().as_bytes());
        t10.push(b':');
        t10.extend_from_slice(serial.as_bytes());
    }
    t10.truncate(u8::MAX as usize);
    out.put_bytes(&[0x02, 0x01, 0x00, t10.len() as u8])?;
    out.put_bytes(&t10)?;

    if let Some(port) = &cmd.lun().port {
        let proto = port.proto_ident << 4;

        // Relative target port
        out.put_bytes(&[proto | 0x01, 0x94, 0x00, 0x04, 0x00, 0x00])?;
        out.put_u16(port.rtpi)?;

        if attrs.emulate_alua {
            if let Some(tg_pt_gp) = port.tg_pt_gp.current() {
                out.put_bytes(&[proto | 0x01, 0x95, 0x00, 0x04, 0x00, 0x00])?;
                out.put_u16(tg_pt_gp.id)?;
            }
            if let Some(lu_gp) = dev.lu_group().current() {
                out.put_bytes(&[0x01, 0x06, 0x00, 0x04, 0x00, 0x00])?;
                out.put_u16(lu_gp.id)?;
            }
        }

        // SCSI name string: NUL terminated, padded to a multiple of four
        let mut name = format!("{},t,0x{:04x}", port.wwn, port.tpgt).into_bytes();
        name.truncate(251);
        name.push(0);
        let padded_len = (name.len() + 3) & !3;
        out.put_bytes(&[proto | 0x03, 0x98, 0x00, padded_len as u8])?;
        out.put_padded(&name, padded_len, 0)?;
    }

    if let Some(volume) = dev.backend().volume_name() {
        let name = &volume.as_bytes()[..volume.len().min(MAX_VOLUME_NAME_LEN)];
        out.put_bytes(&[0x03, 0x08, 0x00, name.len() as u8])?;
        out.put_bytes(name)?;
    }
    Ok(())
}

fn padded(s: &str, width: usize) -> Vec<u8> {
    let mut field = vec![b' '; width];
    let n = s.len().min(width);
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
    field
}

fn extended_inquiry(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    let body = out.reserve(0x3c)?;
    body[1] = 0x07; // HEADSUP, ORDSUP, SIMPSUP
    if cmd.device().attrs().emulate_write_cache {
        body[2] = 0x01; // V_SUP
    }
    Ok(())
}

fn block_limits(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    let attrs = cmd.device().attrs();
    let thin = attrs.thin_provisioning();
    let body = out.reserve(if thin { 0x3c } else { 0x10 })?;

    body[0] = 0x01; // WSNZ
    body[1] = 0x01; // maximum compare and write length
    BigEndian::write_u16(&mut body[2..4], 1); // optimal transfer length granularity
    BigEndian::write_u32(&mut body[4..8], attrs.fabric_max_sectors);
    BigEndian::write_u32(&mut body[8..12], attrs.optimal_sectors);

    if thin {
        BigEndian::write_u32(&mut body[16..20], attrs.max_unmap_lba_count);
        BigEndian::write_u32(&mut body[20..24], attrs.max_unmap_block_desc_count);
        BigEndian::write_u32(&mut body[24..28], attrs.unmap_granularity);
        BigEndian::write_u32(&mut body[28..32], attrs.unmap_granularity_alignment);
        if attrs.unmap_granularity_alignment != 0 {
            body[28] |= 0x80; // UGAVALID
        }
        BigEndian::write_u64(&mut body[32..40], MAX_WRITE_SAME_LEN);
    }
    Ok(())
}

fn block_characteristics(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    let body = out.reserve(0x3c)?;
    if cmd.device().attrs().is_nonrot {
        body[1] = 0x01; // non-rotating medium
    }
    Ok(())
}

fn thin_provisioning(cmd: &Command, out: &mut ResponseBuf) -> Result<(), SenseReason> {
    let attrs = cmd.device().attrs();
    let body = out.reserve(4)?;
    body[0] = 0; // threshold exponent
    if attrs.emulate_tpu {
        body[1] = 0x84; // LBPU, LBPRZ
    }
    if attrs.emulate_tpws {
        body[1] |= 0x64; // LBPWS, LBPWS10, LBPRZ
    }
    body[2] = 0x02; // provisioning type: thin
    Ok(())
}

/// Mode pages
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ModePage {
    ReadWriteErrorRecovery,
    Caching,
    Control,
    InformationalExceptions,
}

impl ModePage {
    /// Table order used for the all-pages wildcard
    pub const ALL: &'static [Self] = &[
        Self::ReadWriteErrorRecovery,
        Self::Caching,
        Self::Control,
        Self::InformationalExceptions,
    ];

    /// (page code, subpage code)
    pub const fn page_code(self) -> (u8, u8) {
        match self {
            Self::ReadWriteErrorRecovery => (0x01, 0),
            Self::Caching => (0x08, 0),
            Self::Control => (0x0a, 0),
            Self::InformationalExceptions => (0x1c, 0),
        }
    }

    pub const fn page_length(self) -> u8 {
        match self {
            Self::ReadWriteErrorRecovery => 0x0a,
            Self::Caching => 0x12,
            Self::Control => 0x0a,
            Self::InformationalExceptions => 0x0a,
        }
    }

    pub fn find(page: u8, subpage: u8) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|mp| mp.page_code() == (page, subpage))
    }

    /// Pages selected by the 3Fh wildcard with `subpage` (00h or FFh)
    pub fn wildcard(subpage: u8) -> impl Iterator<Item = Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(move |mp| mp.page_code().1 & !subpage == 0)
    }

    /// Write the page for page control `pc`, returning its total length
    ///
    /// The changeable values mask is all zero: nothing can be changed.
    pub fn fill(self, dev: &Device, pc: u8, out: &mut ResponseBuf) -> Result<usize, SenseReason> {
        let len = 2 + self.page_length() as usize;
        let p = out.reserve(len)?;
        p[0] = self.page_code().0;
        p[1] = self.page_length();
        if pc == PC_CHANGEABLE {
            return Ok(len);
        }

        let attrs = dev.attrs();
        match self {
            Self::ReadWriteErrorRecovery | Self::InformationalExceptions => {}
            Self::Caching => {
                if attrs.emulate_write_cache {
                    p[2] = 0x04; // WCE
                }
                p[12] = 0x20; // disable read ahead
            }
            Self::Control => {
                p[2] = 0x02; // GLTSD
                p[3] = if attrs.emulate_rest_reord { 0x00 } else { 0x10 }; // QAM
                if attrs.offload_reservations {
                    p[3] |= 0x08; // NUAR
                }
                p[4] = match attrs.emulate_ua_intlck_ctrl {
                    2 => 0x30,
                    1 => 0x20,
                    _ => 0x00,
                };
                if attrs.emulate_tas {
                    p[5] = 0x40; // TAS
                }
                p[8] = 0xff; // busy timeout period
                p[9] = 0xff;
                p[11] = 30; // extended self-test completion time
            }
        }
        Ok(len)
    }
}
