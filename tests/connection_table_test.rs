//! Connection table allocation, lookup and slot reuse.

mod common;

use common::*;
use ldap_core::connection::{ConnState, StructState};
use ldap_core::transport::{PeerInfo, SecurityFactors};
use ldap_core::CoreError;

fn small() -> ldap_core::CoreConfig {
    let mut cfg = config(2, 1, 16);
    cfg.max_connections = 2;
    cfg
}

#[test]
fn test_table_full_until_a_slot_is_freed() {
    let (d, _h) = dispatcher(&small());
    let (_t1, first) = connect(&d, 1);
    connect(&d, 2);
    assert_eq!(d.table().len(), 2);

    let err = d
        .accept(MockTransport::new(3), PeerInfo::default(), SecurityFactors::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::TableFull { capacity: 2 }));

    d.close(1, "test").unwrap();
    let (_t3, third) = connect(&d, 3);
    assert_eq!(third.key().index, first.key().index);
    assert_eq!(third.key().generation, first.key().generation + 1);
    assert!(third.id() > first.id());

    // The old handle no longer resolves, even though its slot is live.
    assert!(matches!(d.table().relock(&first), Err(CoreError::StaleKey)));
    assert!(matches!(d.table().lock(first.key()), Err(CoreError::StaleKey)));
    assert_eq!(d.table().lock(third.key()).unwrap().id(), third.id());
}

#[test]
fn test_duplicate_transport_handle_rejected() {
    let (d, _h) = dispatcher(&small());
    connect(&d, 1);
    let err = d
        .accept(MockTransport::new(1), PeerInfo::default(), SecurityFactors::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateHandle(1)));
    assert_eq!(d.table().len(), 1);
}

#[test]
fn test_transport_handle_reusable_after_close() {
    let (d, _h) = dispatcher(&small());
    let (t, _) = connect(&d, 5);
    d.close(5, "test").unwrap();
    assert!(t.is_closed());
    assert!(matches!(d.receive(5, search(1)), Err(CoreError::UnknownHandle(5))));

    let (t2, _) = connect(&d, 5);
    assert!(!t2.is_closed());
    assert_eq!(d.table().lookup(5).unwrap().state(), ConnState::Inactive);
}

#[test]
fn test_slot_states_follow_lifecycle() {
    let (d, _h) = dispatcher(&small());
    let table = d.table();
    assert_eq!(table.capacity(), 2);
    assert_eq!(table.slot_state(0), Some(StructState::Uninitialized));
    assert_eq!(table.slot_state(2), None);

    connect(&d, 1);
    assert_eq!(table.slot_state(0), Some(StructState::Used));
    assert_eq!(table.slot_state(1), Some(StructState::Uninitialized));

    d.close(1, "test").unwrap();
    assert_eq!(table.slot_state(0), Some(StructState::Unused));
    assert!(table.is_empty());
}

#[test]
fn test_snapshot_reports_state_and_flags() {
    let (d, _h) = dispatcher(&small());
    connect(&d, 1);
    d.receive(1, search(1)).unwrap();
    assert!(wait_until(WAIT, || d.connections()[0].counters.completed == 1));

    let info = &d.connections()[0];
    assert_eq!(info.state, ConnState::Active);
    assert_eq!(info.handle, 1);
    assert_eq!(info.local, "10.0.0.2:389");
    assert!(info.flags.contains('r'));
    assert_eq!(info.counters.pdus_written, 2);
    assert_eq!(info.bound_dn, "");
}

#[test]
fn test_client_connection_flags() {
    let (d, _h) = dispatcher(&small());
    let auth = ldap_core::connection::AuthInfo::simple("cn=sync", 3);
    d.accept_client(MockTransport::new(9), PeerInfo::new("internal", "internal"), auth)
        .unwrap();
    let info = &d.connections()[0];
    assert_eq!(info.state, ConnState::Client);
    assert!(info.flags.contains('c'));
    assert_eq!(info.bound_dn, "cn=sync");
}
