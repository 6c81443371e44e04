// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::BulkContext;
use crate::entry::SyncEvent;
use crate::transport::{IoContext, WorkQueueId};

fn ioc(seq: u32, msg: &[u8]) -> IoContext {
    IoContext {
        entry: None,
        msg: msg.to_vec(),
        seq,
        event: SyncEvent::AddAck,
        queue: WorkQueueId::Default,
    }
}

#[test]
fn bulk_identified_by_first_seq() {
    let mut bulk = BulkContext::new(WorkQueueId::Default);
    bulk.push(ioc(11, b"aa"));
    bulk.push(ioc(13, b"bbb"));
    bulk.push(ioc(15, b"c"));

    assert_eq!(bulk.seq(), 11);
    assert_eq!(bulk.len(), 3);
    assert_eq!(bulk.bytes(), 6);
    assert_eq!(bulk.concat(), b"aabbbc".to_vec());
}

#[test]
fn response_walk_is_ordered() {
    let mut bulk = BulkContext::new(WorkQueueId::Default);
    bulk.push(ioc(1, b"x"));
    bulk.push(ioc(3, b"y"));

    assert!(bulk.current().is_none());
    assert!(!bulk.responses_complete());

    let first = bulk.next_response().map(|i| i.seq);
    assert_eq!(first, Some(1));
    assert_eq!(bulk.current().map(|i| i.seq), Some(1));

    let second = bulk.next_response().map(|i| i.seq);
    assert_eq!(second, Some(3));
    assert!(bulk.responses_complete());
    assert!(bulk.next_response().is_none());
}

#[test]
#[should_panic]
fn mixed_queues_rejected() {
    let mut bulk = BulkContext::new(WorkQueueId::Default);
    bulk.push(IoContext {
        entry: None,
        msg: Vec::new(),
        seq: 2,
        event: SyncEvent::AddAck,
        queue: WorkQueueId::Telemetry,
    });
}
