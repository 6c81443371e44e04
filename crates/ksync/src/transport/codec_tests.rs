// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::error::FramingError;

const FAMILY: u16 = 24;

#[test]
fn frame_roundtrip() {
    let mut blobs = Vec::new();
    write_blob(&mut blobs, BLOB_OBJECT_REQ, b"hello");
    let frame = encode_frame(FAMILY, 0x1001, 42, &blobs);

    assert!(validate_frame(&frame, FAMILY).is_ok());
    assert_eq!(frame_seq(&frame), 0x1001);
    assert_eq!(frame_family(&frame), FAMILY);
    assert!(!frame_has_more(&frame));

    let decoded: Vec<_> = BlobIter::new(frame_payload(&frame)).collect();
    assert_eq!(decoded, vec![(BLOB_OBJECT_REQ, b"hello".as_slice())]);
}

#[test]
fn multi_segment_flags() {
    let seg = encode_frame_multi(FAMILY, 7, &[], true);
    assert!(frame_has_more(&seg));

    let done = encode_done(7);
    assert!(validate_frame(&done, FAMILY).is_ok());
    assert!(!frame_has_more(&done));
    assert_eq!(frame_seq(&done), 7);
    assert!(frame_payload(&done).is_empty());
}

#[test]
fn truncated_frame_rejected() {
    let frame = encode_frame(FAMILY, 1, 0, &[]);
    assert_eq!(validate_frame(&frame[..8], FAMILY), Err(FramingError::Truncated));
}

#[test]
fn wrong_family_rejected() {
    let frame = encode_frame(99, 1, 0, &[]);
    assert_eq!(
        validate_frame(&frame, FAMILY),
        Err(FramingError::BadFamily { family: 99 })
    );
}

#[test]
fn error_family_rejected() {
    let frame = encode_frame(FAMILY_ERROR, 5, 0, &[]);
    assert_eq!(
        validate_frame(&frame, FAMILY),
        Err(FramingError::ErrorMessage { seq: 5 })
    );
}

#[test]
fn bad_command_rejected() {
    let mut frame = encode_frame(FAMILY, 1, 0, &[]);
    frame[HEADER_LEN] = 9;
    assert_eq!(validate_frame(&frame, FAMILY), Err(FramingError::BadCommand { cmd: 9 }));
}

#[test]
fn oversized_length_rejected() {
    let mut frame = encode_frame(FAMILY, 1, 0, &[]);
    frame[0..4].copy_from_slice(&(MAX_MESSAGE as u32 + 1).to_le_bytes());
    assert!(matches!(
        validate_frame(&frame, FAMILY),
        Err(FramingError::BadLength { .. })
    ));
}

#[test]
fn blob_iter_stops_at_truncation() {
    let mut blobs = Vec::new();
    write_blob(&mut blobs, BLOB_OBJECT_REQ, b"abc");
    blobs.extend_from_slice(&[1, 0, 255, 255]); // header claiming a huge payload
    let decoded: Vec<_> = BlobIter::new(&blobs).collect();
    assert_eq!(decoded.len(), 1);
}

#[test]
fn vr_response_roundtrip() {
    let payload = encode_vr_response(-13);
    assert_eq!(parse_vr_response(&payload), Some(-13));
    assert_eq!(parse_vr_response(&payload[..2]), None);
}

#[test]
fn flow_info_roundtrip() {
    let info = FlowInfo { index: 0xdead_beef, gen_id: 250, flags: 3 };
    let payload = encode_flow_info(&info);
    assert_eq!(parse_flow_info(&payload), Some(info));
}

#[test]
fn table_info_roundtrip() {
    let info = TableInfo {
        major_dev: 240,
        entry_size: 64,
        size: 1 << 20,
        path: "/dev/flow".to_string(),
    };
    let payload = encode_table_info(&info);
    assert_eq!(parse_table_info(&payload), Some(info));
}

#[test]
fn udp_frame_roundtrip() {
    let mut blobs = Vec::new();
    write_blob(&mut blobs, BLOB_VR_RESPONSE, &encode_vr_response(0));
    let frame = encode_udp_frame(9, &blobs, true);

    assert!(validate_udp_frame(&frame).is_ok());
    assert_eq!(udp_seq(&frame), 9);
    assert!(udp_has_more(&frame));
    assert_eq!(udp_payload(&frame), blobs.as_slice());
}
