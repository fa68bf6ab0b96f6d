// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::test::{connect, Endpoint, RtrListenerChannel};
use crate::messages::{
    CacheResetPdu, CacheResponsePdu, ErrorCode, Pdu, ResetQueryPdu,
    SerialQueryPdu, FLAG_ANNOUNCE, FLAG_WITHDRAW, VERSION_0, VERSION_1,
};
use crate::server::{Server, ServerConfig};
use crate::session::SessionConfig;
use std::net::SocketAddr;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::spawn;
use vdb::{Db, Vrp, VrpSet};

const SESSION_ID: u16 = 0x1122;

fn vrp(s: &str, asn: u32, max_length: u8) -> Vrp {
    Vrp {
        prefix: s.parse().unwrap(),
        asn,
        max_length,
    }
}

fn set(vrps: &[Vrp]) -> VrpSet {
    vrps.iter().copied().collect()
}

fn start_server(addr: &str, retention: usize, maxconn: usize) -> (Arc<Server>, Db) {
    let log = rtr_common::log::init_logger();
    let db = Db::new(SESSION_ID, retention, log.clone());
    let server = Server::new(
        db.clone(),
        ServerConfig {
            session: SessionConfig::default(),
            maxconn,
        },
        None,
        log,
    );
    let listener =
        RtrListenerChannel::bind(addr.parse().unwrap()).expect("bind channel");
    let s = server.clone();
    spawn(move || s.serve(listener));
    (server, db)
}

fn client(from: &str, to: &str) -> Endpoint {
    let from: SocketAddr = from.parse().unwrap();
    let to: SocketAddr = to.parse().unwrap();
    connect(from, to)
}

#[test]
fn cold_start_reset_query() {
    let (_server, db) = start_server("1.0.0.1:8282", 3, 0);
    db.install(set(&[
        vrp("10.0.0.0/24", 1, 24),
        vrp("2001:db8::/32", 2, 48),
    ]));

    let c = client("9.0.0.1:100", "1.0.0.1:8282");
    c.send(Pdu::ResetQuery(ResetQueryPdu { version: VERSION_1 }));

    match c.recv() {
        Pdu::CacheResponse(p) => {
            assert_eq!(p.session, SESSION_ID);
            assert_eq!(p.version, VERSION_1);
        }
        other => panic!("expected cache response, got {other:?}"),
    }
    match c.recv() {
        Pdu::Ipv4Prefix(p) => {
            assert_eq!(p.flags, FLAG_ANNOUNCE);
            assert_eq!(p.prefix, "10.0.0.0".parse::<std::net::Ipv4Addr>().unwrap());
            assert_eq!(p.prefix_length, 24);
            assert_eq!(p.max_length, 24);
            assert_eq!(p.asn, 1);
        }
        other => panic!("expected v4 prefix, got {other:?}"),
    }
    match c.recv() {
        Pdu::Ipv6Prefix(p) => {
            assert_eq!(p.flags, FLAG_ANNOUNCE);
            assert_eq!(p.prefix_length, 32);
            assert_eq!(p.max_length, 48);
            assert_eq!(p.asn, 2);
        }
        other => panic!("expected v6 prefix, got {other:?}"),
    }
    match c.recv() {
        Pdu::EndOfData(p) => {
            assert_eq!(p.serial, 0);
            assert_eq!(p.session, SESSION_ID);
            assert_eq!(p.refresh, 3600);
            assert_eq!(p.retry, 600);
            assert_eq!(p.expire, 7200);
        }
        other => panic!("expected end of data, got {other:?}"),
    }
}

#[test]
fn incremental_serial_query() {
    let (_server, db) = start_server("1.0.0.2:8282", 3, 0);
    db.install(set(&[
        vrp("10.0.0.0/24", 1, 24),
        vrp("2001:db8::/32", 2, 48),
    ]));
    db.install(set(&[
        vrp("10.0.0.0/24", 1, 24),
        vrp("10.0.1.0/24", 1, 24),
    ]));

    let c = client("9.0.0.2:100", "1.0.0.2:8282");
    c.send(Pdu::SerialQuery(SerialQueryPdu {
        version: VERSION_1,
        session: SESSION_ID,
        serial: 0,
    }));

    assert!(matches!(c.recv(), Pdu::CacheResponse(_)));
    match c.recv() {
        Pdu::Ipv4Prefix(p) => {
            assert_eq!(p.flags, FLAG_ANNOUNCE);
            assert_eq!(p.prefix, "10.0.1.0".parse::<std::net::Ipv4Addr>().unwrap());
        }
        other => panic!("expected v4 announce, got {other:?}"),
    }
    match c.recv() {
        Pdu::Ipv6Prefix(p) => {
            assert_eq!(p.flags, FLAG_WITHDRAW);
        }
        other => panic!("expected v6 withdraw, got {other:?}"),
    }
    match c.recv() {
        Pdu::EndOfData(p) => assert_eq!(p.serial, 1),
        other => panic!("expected end of data, got {other:?}"),
    }
}

#[test]
fn session_id_mismatch_forces_reset() {
    let (_server, db) = start_server("1.0.0.3:8282", 3, 0);
    db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));

    let c = client("9.0.0.3:100", "1.0.0.3:8282");
    c.send(Pdu::SerialQuery(SerialQueryPdu {
        version: VERSION_1,
        session: SESSION_ID ^ 1,
        serial: 0,
    }));

    assert!(matches!(c.recv(), Pdu::CacheReset(CacheResetPdu { .. })));
}

#[test]
fn out_of_window_serial_forces_reset() {
    let (_server, db) = start_server("1.0.0.4:8282", 1, 0);
    db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));
    db.install(set(&[vrp("10.0.1.0/24", 1, 24)]));
    db.install(set(&[vrp("10.0.2.0/24", 1, 24)]));
    db.install(set(&[vrp("10.0.3.0/24", 1, 24)]));
    assert_eq!(db.current_serial(), Some(3));

    let c = client("9.0.0.4:100", "1.0.0.4:8282");
    c.send(Pdu::SerialQuery(SerialQueryPdu {
        version: VERSION_1,
        session: SESSION_ID,
        serial: 0,
    }));

    assert!(matches!(c.recv(), Pdu::CacheReset(CacheResetPdu { .. })));
}

#[test]
fn version_is_fixed_by_first_pdu() {
    let (_server, db) = start_server("1.0.0.5:8282", 3, 0);
    db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));

    let c = client("9.0.0.5:100", "1.0.0.5:8282");
    c.send(Pdu::ResetQuery(ResetQueryPdu { version: VERSION_0 }));

    // All replies are framed at the negotiated version 0, without timers.
    match c.recv() {
        Pdu::CacheResponse(CacheResponsePdu { version, .. }) => {
            assert_eq!(version, VERSION_0)
        }
        other => panic!("expected cache response, got {other:?}"),
    }
    assert!(matches!(c.recv(), Pdu::Ipv4Prefix(_)));
    match c.recv() {
        Pdu::EndOfData(p) => assert_eq!(p.version, VERSION_0),
        other => panic!("expected end of data, got {other:?}"),
    }

    // Changing version mid-session is a protocol error.
    c.send(Pdu::ResetQuery(ResetQueryPdu { version: VERSION_1 }));
    match c.recv() {
        Pdu::ErrorReport(p) => {
            assert_eq!(p.code, ErrorCode::UnexpectedProtocolVersion)
        }
        other => panic!("expected error report, got {other:?}"),
    }
}

#[test]
fn cache_originated_pdu_is_an_invalid_request() {
    let (_server, db) = start_server("1.0.0.6:8282", 3, 0);
    db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));

    let c = client("9.0.0.6:100", "1.0.0.6:8282");
    c.send(Pdu::CacheResponse(CacheResponsePdu {
        version: VERSION_1,
        session: SESSION_ID,
    }));

    match c.recv() {
        Pdu::ErrorReport(p) => assert_eq!(p.code, ErrorCode::InvalidRequest),
        other => panic!("expected error report, got {other:?}"),
    }
}

#[test]
fn queries_before_first_install_get_no_data() {
    let (_server, _db) = start_server("1.0.0.7:8282", 3, 0);

    let c = client("9.0.0.7:100", "1.0.0.7:8282");
    c.send(Pdu::ResetQuery(ResetQueryPdu { version: VERSION_1 }));

    match c.recv() {
        Pdu::ErrorReport(p) => assert_eq!(p.code, ErrorCode::NoDataAvailable),
        other => panic!("expected error report, got {other:?}"),
    }
}

#[test]
fn notify_broadcast_reaches_waiting_clients() {
    let (server, db) = start_server("1.0.0.8:8282", 3, 0);
    db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));

    let c = client("9.0.0.8:100", "1.0.0.8:8282");
    // Speak once so the session has a negotiated version.
    c.send(Pdu::ResetQuery(ResetQueryPdu { version: VERSION_1 }));
    loop {
        if matches!(c.recv(), Pdu::EndOfData(_)) {
            break;
        }
    }

    db.install(set(&[vrp("10.0.1.0/24", 1, 24)]));
    server.notify_clients_latest();

    match c.recv() {
        Pdu::SerialNotify(p) => {
            assert_eq!(p.serial, 1);
            assert_eq!(p.session, SESSION_ID);
        }
        other => panic!("expected serial notify, got {other:?}"),
    }
}

#[test]
fn connection_cap_rejects_excess_clients() {
    let (server, db) = start_server("1.0.0.9:8282", 3, 1);
    db.install(set(&[vrp("10.0.0.0/24", 1, 24)]));

    let first = client("9.0.0.9:100", "1.0.0.9:8282");
    first.send(Pdu::ResetQuery(ResetQueryPdu { version: VERSION_1 }));
    loop {
        if matches!(first.recv(), Pdu::EndOfData(_)) {
            break;
        }
    }
    assert_eq!(server.client_count(), 1);

    // The second client is closed before any RTR exchange.
    let second = client("9.0.0.10:100", "1.0.0.9:8282");
    match second.recv_err() {
        Err(RecvTimeoutError::Disconnected) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);
}
