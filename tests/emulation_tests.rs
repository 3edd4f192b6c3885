//! Emulated command tests
//!
//! INQUIRY (standard and VPD), MODE SENSE/SELECT, REQUEST SENSE and READ
//! CAPACITY against the fixture devices.

mod common;

use common::{sense_triple, Caps, Harness};
use scsi_target_core::device::{LuGroup, Port, TargetPortGroup};
use scsi_target_core::sense::{asc, scsi_status, sense_key};
use scsi_target_core::Lun;
use std::sync::Arc;

const ISCSI_PROTOCOL_ID: u8 = 0x5;

fn inquiry_vpd(page: u8) -> [u8; 6] {
    [0x12, 0x01, page, 0x01, 0x00, 0x00]
}

fn page_len(data: &[u8]) -> usize {
    u16::from_be_bytes([data[2], data[3]]) as usize
}

// ============================================================================
// INQUIRY
// ============================================================================

#[test]
fn test_supported_pages_need_a_serial() {
    let plain = Harness::new("plain", Caps::none());
    let cmd = plain.run_in(&inquiry_vpd(0x00), 256);
    assert_eq!(cmd.status(), Some(scsi_status::GOOD));
    let data = cmd.data();
    assert_eq!(data[1], 0x00);
    assert_eq!(page_len(&data), 0);

    let thin = Harness::new("thin", Caps::none());
    let data = thin.run_in(&inquiry_vpd(0x00), 256).data();
    assert_eq!(page_len(&data), 7);
    assert_eq!(&data[4..11], &[0x00, 0x80, 0x83, 0x86, 0xb0, 0xb1, 0xb2]);
}

#[test]
fn test_unit_serial_page() {
    let h = Harness::new("thin", Caps::none());
    let serial = b"6001405abcdef0123456789";
    let data = h.run_in(&inquiry_vpd(0x80), 256).data();
    assert_eq!(data[1], 0x80);
    assert_eq!(page_len(&data), serial.len() + 1);
    assert_eq!(&data[4..4 + serial.len()], serial);
    assert_eq!(data[4 + serial.len()], 0);
}

#[test]
fn test_device_identification_through_port() {
    let port = Port::new(2, ISCSI_PROTOCOL_ID, "iqn.2025-12.local:tgt", 1);
    port.tg_pt_gp.set(Some(TargetPortGroup {
        id: 7,
        access_type: 0x10,
    }));
    let lun = Lun::new(0).with_port(Arc::new(port));
    let h = Harness::with_lun("big4k", Caps::none(), lun);
    h.dev.lu_group().set(Some(LuGroup { id: 3 }));

    let cmd = h.run_in(&inquiry_vpd(0x83), 512);
    assert_eq!(cmd.status(), Some(scsi_status::GOOD));
    let data = cmd.data();
    assert_eq!(data[1], 0x83);

    // NAA IEEE Registered Extended, serial "c0ffee"
    assert_eq!(&data[4..8], &[0x01, 0x03, 0x00, 0x10]);
    assert_eq!(&data[8..12], &[0x60, 0x01, 0x40, 0x50]);
    assert_eq!(&data[12..15], &[0xc0, 0xff, 0xee]);
    assert!(data[15..24].iter().all(|&b| b == 0));

    // T10 vendor id
    assert_eq!(&data[24..28], &[0x02, 0x01, 0x00, 21]);
    assert_eq!(&data[28..49], b"LIO-ORG IBLOCK:c0ffee");

    // Relative target port, target port group, LU group
    assert_eq!(&data[49..57], &[0x51, 0x94, 0, 4, 0, 0, 0, 2]);
    assert_eq!(&data[57..65], &[0x51, 0x95, 0, 4, 0, 0, 0, 7]);
    assert_eq!(&data[65..73], &[0x01, 0x06, 0, 4, 0, 0, 0, 3]);

    // SCSI name string, NUL terminated and padded to 32
    let name = b"iqn.2025-12.local:tgt,t,0x0001";
    assert_eq!(&data[73..77], &[0x53, 0x98, 0, 32]);
    assert_eq!(&data[77..77 + name.len()], name);
    assert!(data[77 + name.len()..109].iter().all(|&b| b == 0));

    assert_eq!(page_len(&data), 109 - 4);
}

#[test]
fn test_device_identification_without_serial_or_port() {
    let h = Harness::build("plain", Caps::none(), Lun::new(0), |b| {
        b.with_volume_name("scratch-vol")
    });
    let data = h.run_in(&inquiry_vpd(0x83), 512).data();

    // T10 vendor id carries only the vendor without a serial
    assert_eq!(&data[4..8], &[0x02, 0x01, 0x00, 8]);
    assert_eq!(&data[8..16], b"LIO-ORG ");
    assert_eq!(&data[16..20], &[0x03, 0x08, 0x00, 11]);
    assert_eq!(&data[20..31], b"scratch-vol");
    assert_eq!(page_len(&data), 31 - 4);
}

#[test]
fn test_block_limits_length_follows_thin_provisioning() {
    let plain = Harness::new("plain", Caps::none());
    let data = plain.run_in(&inquiry_vpd(0xb0), 256).data();
    assert_eq!(page_len(&data), 0x10);
    assert_eq!(data[4], 0x01); // WSNZ

    let thin = Harness::new("thin", Caps::none());
    let data = thin.run_in(&inquiry_vpd(0xb0), 256).data();
    assert_eq!(page_len(&data), 0x3c);
    assert_eq!(&data[20..24], &1024u32.to_be_bytes());
    assert_eq!(&data[24..28], &4u32.to_be_bytes());
    assert_eq!(&data[28..32], &8u32.to_be_bytes());
    assert_eq!(&data[32..36], &[0x80, 0, 0, 4]);
}

#[test]
fn test_thin_provisioning_and_characteristics_pages() {
    let h = Harness::new("thin", Caps::none());
    let data = h.run_in(&inquiry_vpd(0xb2), 256).data();
    assert_eq!(page_len(&data), 4);
    assert_eq!(data[5], 0x84 | 0x64);
    assert_eq!(data[6], 0x02);

    let data = h.run_in(&inquiry_vpd(0xb1), 256).data();
    assert_eq!(page_len(&data), 0x3c);
    assert_eq!(data[5], 0x01);

    let data = h.run_in(&inquiry_vpd(0x86), 256).data();
    assert_eq!(data[5], 0x07);
    assert_eq!(data[6], 0x01);
}

#[test]
fn test_unknown_vpd_page() {
    let h = Harness::new("thin", Caps::none());
    let cmd = h.run_in(&inquiry_vpd(0x89), 256);
    assert_eq!(cmd.status(), Some(scsi_status::CHECK_CONDITION));
    assert_eq!(
        sense_triple(&cmd),
        (sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    );
}

#[test]
fn test_virtual_lun0_and_alua_bits() {
    let port = Port::new(1, ISCSI_PROTOCOL_ID, "iqn.2025-12.local:tgt", 1);
    port.tg_pt_gp.set(Some(TargetPortGroup {
        id: 1,
        access_type: 0x10,
    }));
    let lun = Lun::new(0).with_port(Arc::new(port)).virtual_lun0();
    let h = Harness::with_lun("big4k", Caps::none(), lun);

    let data = h.run_in(&[0x12, 0, 0, 0, 96, 0], 96).data();
    assert_eq!(data[0], 0x3f);
    assert_eq!(data[5], 0x90);
    assert_eq!(data[4], 91);

    // Block device pages still report the device type
    let data = h.run_in(&inquiry_vpd(0xb0), 256).data();
    assert_eq!(data[0], 0x00);
    let data = h.run_in(&inquiry_vpd(0x80), 256).data();
    assert_eq!(data[0], 0x3f);
}

#[test]
fn test_fabric_version_descriptor() {
    let port = Port::new(1, ISCSI_PROTOCOL_ID, "iqn.2025-12.local:tgt", 1).with_vers_desc(0x0960);
    let lun = Lun::new(0).with_port(Arc::new(port));
    let h = Harness::with_lun("plain", Caps::none(), lun);
    let data = h.run_in(&[0x12, 0, 0, 0, 96, 0], 96).data();
    assert_eq!(&data[58..66], &[0x00, 0x80, 0x09, 0x60, 0x04, 0x60, 0x04, 0xC0]);
}

#[test]
fn test_inquiry_truncated_to_allocation_length() {
    let h = Harness::new("plain", Caps::none());
    let cmd = h.run_in(&[0x12, 0, 0, 0, 36, 0], 36);
    assert_eq!(cmd.status(), Some(scsi_status::GOOD));
    assert_eq!(cmd.data().len(), 36);
    assert_eq!(cmd.residual(), 0);

    // A larger buffer is still limited by the CDB's allocation length
    let cmd = h.run_in(&[0x12, 0, 0, 0, 36, 0], 96);
    assert_eq!(cmd.residual(), 60);
    assert!(cmd.data()[36..].iter().all(|&b| b == 0));

    // Allocation length zero transfers nothing and reports it all as residual
    let cmd = h.run_in(&[0x12, 0, 0, 0, 0, 0], 36);
    assert_eq!(cmd.status(), Some(scsi_status::GOOD));
    assert_eq!(cmd.residual(), 36);
    assert!(cmd.data().iter().all(|&b| b == 0));
}

// ============================================================================
// MODE SENSE / MODE SELECT
// ============================================================================

#[test]
fn test_mode_sense_all_pages_lengths() {
    let h = Harness::new("plain", Caps::none());

    // MODE SENSE (10), DBD: header 8 + 12 + 20 + 12 + 12
    let cdb = [0x5A, 0x08, 0x3f, 0x00, 0, 0, 0, 0x01, 0x00, 0];
    let data = h.run_in(&cdb, 256).data();
    assert_eq!(u16::from_be_bytes([data[0], data[1]]), 64 - 2);
    assert_eq!(&data[6..8], &[0, 0]);
    let pages: Vec<u8> = vec![data[8], data[20], data[40], data[52]];
    assert_eq!(pages, vec![0x01, 0x08, 0x0a, 0x1c]);

    // MODE SENSE (6) with block descriptor: 4 + 8 + 56
    let data = h.run_in(&[0x1A, 0x00, 0x3f, 0xff, 255, 0], 255).data();
    assert_eq!(data[0], 68 - 1);
    assert_eq!(data[3], 8);
}

#[test]
fn test_mode_sense_wildcard_bad_subpage() {
    let h = Harness::new("plain", Caps::none());
    let cmd = h.run_in(&[0x1A, 0x00, 0x3f, 0x01, 255, 0], 255);
    assert_eq!(cmd.status(), Some(scsi_status::CHECK_CONDITION));
    assert_eq!(
        sense_triple(&cmd),
        (sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    );
}

#[test]
fn test_mode_sense_unknown_page() {
    let h = Harness::new("plain", Caps::none());
    for page in [0x03u8, 0x19] {
        let cmd = h.run_in(&[0x1A, 0x00, page, 0x00, 255, 0], 255);
        assert_eq!(cmd.status(), Some(scsi_status::CHECK_CONDITION));
        assert_eq!(sense_triple(&cmd).1, asc::INVALID_FIELD_IN_CDB);
    }
}

#[test]
fn test_mode_sense_long_lba_descriptor() {
    let h = Harness::new("big4k", Caps::none());
    let cdb = [0x5A, 0x10, 0x08, 0x00, 0, 0, 0, 0x01, 0x00, 0];
    let data = h.run_in(&cdb, 256).data();
    assert_eq!(data[4], 0x01); // LONGLBA
    assert_eq!(&data[6..8], &[0, 16]);
    assert_eq!(&data[8..16], &8_589_934_592u64.to_be_bytes());
    assert_eq!(&data[20..24], &4096u32.to_be_bytes());
    assert_eq!(data[24], 0x08);
    assert_eq!(u16::from_be_bytes([data[0], data[1]]) as usize, 24 + 20 - 2);

    // Without LLBAA the block count saturates
    let cdb = [0x5A, 0x00, 0x08, 0x00, 0, 0, 0, 0x01, 0x00, 0];
    let data = h.run_in(&cdb, 256).data();
    assert_eq!(data[4], 0x00);
    assert_eq!(&data[6..8], &[0, 8]);
    assert_eq!(&data[8..12], &[0xff, 0xff, 0xff, 0xff]);
}

#[test]
fn test_mode_sense_write_protect_from_acl() {
    let h = Harness::new("plain", Caps::none());
    let ro = Arc::new(
        scsi_target_core::Session::new(common::OTHER_INITIATOR, h.fabric.clone())
            .with_read_only_acl(true),
    );
    let cdb = [0x1A, 0x08, 0x08, 0, 255, 0];
    let cmd = scsi_target_core::Command::builder(h.dev.clone(), h.lun.clone(), &cdb)
        .tag(h.next_tag())
        .data_length(255)
        .session(ro)
        .build()
        .unwrap();
    h.core.execute(&cmd);
    let data = cmd.data();
    assert_eq!(data[2], 0x80);
    assert_eq!(data[3], 0); // DBD
}

#[test]
fn test_control_page_follows_attributes() {
    let tas = Harness::new("plain", Caps::none());
    let data = tas.run_in(&[0x1A, 0x08, 0x0a, 0x00, 255, 0], 255).data();
    assert_eq!(&data[4..6], &[0x0a, 0x0a]);
    assert_eq!(data[4 + 3], 0x10); // unrestricted reordering
    assert_eq!(data[4 + 5], 0x40); // TAS
    assert_eq!(data[4 + 11], 30);

    let notas = Harness::new("notas", Caps::none());
    let data = notas.run_in(&[0x1A, 0x08, 0x0a, 0x00, 255, 0], 255).data();
    assert_eq!(data[4 + 5], 0x00);

    let offload = Harness::new("offload", Caps::none());
    let data = offload.run_in(&[0x1A, 0x08, 0x0a, 0x00, 255, 0], 255).data();
    assert_eq!(data[4 + 3], 0x18); // NUAR
}

#[test]
fn test_mode_sense_changeable_values() {
    let h = Harness::new("thin", Caps::none());
    let data = h.run_in(&[0x1A, 0x08, 0x48, 0x00, 255, 0], 255).data();
    assert_eq!(&data[4..6], &[0x08, 0x12]);
    assert!(data[6..24].iter().all(|&b| b == 0));
}

#[test]
fn test_mode_select_echo_of_current_values() {
    let h = Harness::new("thin", Caps::none());
    let sense = h.run_in(&[0x1A, 0x08, 0x08, 0x00, 255, 0], 255).data();
    let page = sense[4..24].to_vec();

    let mut params = vec![0u8; 4];
    params.extend_from_slice(&page);
    let cmd = h.run_out(&[0x15, 0x10, 0, 0, params.len() as u8, 0], params.clone());
    assert_eq!(cmd.status(), Some(scsi_status::GOOD));

    // Turning off WCE is a change, which is refused
    params[4 + 2] = 0;
    let cmd = h.run_out(&[0x15, 0x10, 0, 0, params.len() as u8, 0], params);
    assert_eq!(cmd.status(), Some(scsi_status::CHECK_CONDITION));
    assert_eq!(sense_triple(&cmd).1, asc::INVALID_FIELD_IN_CDB);
}

#[test]
fn test_mode_select_10_and_pf() {
    let h = Harness::new("plain", Caps::none());
    let cdb10 = [0x5A, 0x08, 0x1c, 0x00, 0, 0, 0, 0x00, 0xff, 0];
    let sense = h.run_in(&cdb10, 255).data();
    let mut params = vec![0u8; 8];
    params.extend_from_slice(&sense[8..20]);

    let len = params.len() as u8;
    let cmd = h.run_out(&[0x55, 0x10, 0, 0, 0, 0, 0, 0, len, 0], params.clone());
    assert_eq!(cmd.status(), Some(scsi_status::GOOD));

    let cmd = h.run_out(&[0x55, 0x00, 0, 0, 0, 0, 0, 0, len, 0], params);
    assert_eq!(cmd.status(), Some(scsi_status::CHECK_CONDITION));
}

#[test]
fn test_mode_select_unknown_page() {
    let h = Harness::new("plain", Caps::none());
    let params = vec![0, 0, 0, 0, 0x19, 0x06, 0, 0, 0, 0, 0, 0];
    let cmd = h.run_out(&[0x15, 0x10, 0, 0, params.len() as u8, 0], params);
    assert_eq!(cmd.status(), Some(scsi_status::CHECK_CONDITION));
}

// ============================================================================
// REQUEST SENSE / READ CAPACITY
// ============================================================================

#[test]
fn test_request_sense_reports_unit_attention_once() {
    let h = Harness::new("plain", Caps::none());
    h.session.allocate_ua(0, 0x29, 0x00);

    let data = h.run_in(&[0x03, 0, 0, 0, 18, 0], 18).data();
    assert_eq!(data[0], 0x70);
    assert_eq!(data[2], sense_key::UNIT_ATTENTION);
    assert_eq!(data[7], 0x0A);
    assert_eq!(&data[12..14], &[0x29, 0x00]);

    let data = h.run_in(&[0x03, 0, 0, 0, 18, 0], 18).data();
    assert_eq!(data[2], sense_key::NO_SENSE);
    assert_eq!(&data[12..14], &[0, 0]);
}

#[test]
fn test_read_capacity_pair() {
    let h = Harness::new("thin", Caps::none());
    let data = h.run_in(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], 8).data();
    assert_eq!(&data[0..4], &2047u32.to_be_bytes());
    assert_eq!(&data[4..8], &512u32.to_be_bytes());

    let mut cdb = [0u8; 16];
    cdb[0] = 0x9E;
    cdb[1] = 0x10;
    cdb[13] = 32;
    let data = h.run_in(&cdb, 32).data();
    assert_eq!(&data[0..8], &2047u64.to_be_bytes());
    assert_eq!(data[14], 0xC0);
}
