//! RFC-driven tests for the routing module.
//!
//! These tests validate compliance with:
//! - RFC 9000 Section 5.2: matching packets to connections
//! - RFC 9000 Section 6: version negotiation
//! - RFC 9000 Section 8.1: address validation with Retry
//!
//! Clients are real simulated engines; their datagrams go through the
//! dispatcher exactly as they would arrive from a socket.

use super::*;
use crate::connection::Connection;
use crate::token::TokenService;
use proptest::prelude::*;
use quicloop_engine::packet::varint;
use quicloop_engine::{
    ConnectionId, Header, PacketType, ProtocolEngine, SimEngine, TransportSettings, VERSION_1,
};
use std::net::SocketAddr;

const BUF: usize = 1500;
const UNSUPPORTED_VERSION: u32 = 0xbaba_baba;

fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

fn client_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn dispatcher(options: DispatchOptions) -> PacketDispatcher<SimEngine> {
    let config = SimEngine::configure(&TransportSettings::default()).unwrap();
    PacketDispatcher::new(
        config,
        server_addr(),
        TokenService::with_key(11, 22),
        Box::new(SequentialConnectionIdGenerator::new(1)),
        DerivedConnectionIds::with_key(33, 44),
        options,
    )
}

fn no_retry() -> DispatchOptions {
    DispatchOptions {
        retry: false,
        ..Default::default()
    }
}

fn client_with_version(port: u16, version: u32) -> Connection<SimEngine> {
    let settings = TransportSettings {
        version,
        ..Default::default()
    };
    let mut config = SimEngine::configure(&settings).unwrap();
    let scid = ConnectionId::from_slice(&[port as u8; 20]).unwrap();
    Connection::connect(&mut config, Some("localhost"), scid, client_addr(port), server_addr()).unwrap()
}

fn client(port: u16) -> Connection<SimEngine> {
    client_with_version(port, VERSION_1)
}

/// A padded long-header datagram: first byte, version, IDs, then `rest`.
fn long_header(first: u8, version: u32, dcid: &[u8], scid: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut datagram = vec![first];
    datagram.extend_from_slice(&version.to_be_bytes());
    datagram.push(dcid.len() as u8);
    datagram.extend_from_slice(dcid);
    datagram.push(scid.len() as u8);
    datagram.extend_from_slice(scid);
    datagram.extend_from_slice(rest);
    datagram.resize(1200, 0);
    datagram
}

fn next_datagram(conn: &mut Connection<SimEngine>) -> Vec<u8> {
    let mut out = [0u8; BUF];
    let (n, to) = conn.send(&mut out).unwrap();
    assert_eq!(to, server_addr());
    out[..n].to_vec()
}

fn dispatch(
    dispatcher: &mut PacketDispatcher<SimEngine>,
    registry: &mut ConnectionRegistry<SimEngine>,
    datagram: &[u8],
    from: SocketAddr,
) -> Dispatch {
    let mut buf = datagram.to_vec();
    dispatcher.dispatch(registry, &mut buf, from).unwrap()
}

/// Run datagrams both ways until neither side has anything to send.
fn pump(
    client: &mut Connection<SimEngine>,
    dispatcher: &mut PacketDispatcher<SimEngine>,
    registry: &mut ConnectionRegistry<SimEngine>,
) {
    let mut out = [0u8; BUF];
    for _ in 0..16 {
        let mut moved = 0;
        while let Ok((n, _)) = client.send(&mut out) {
            match dispatcher.dispatch(registry, &mut out[..n], client.local()).unwrap() {
                Dispatch::Retry(mut reply) | Dispatch::Negotiate(mut reply) => {
                    let _ = client.recv(&mut reply, server_addr());
                }
                _ => {}
            }
            moved += 1;
        }
        for conn in registry.iter_mut() {
            while let Ok((n, to)) = conn.send(&mut out) {
                if to == client.local() {
                    let _ = client.recv(&mut out[..n], server_addr());
                }
                moved += 1;
            }
        }
        if moved == 0 {
            return;
        }
    }
}

// ============================================================================
// RFC 9000 Section 6 - Version Negotiation
// ============================================================================

/// RFC 9000 Section 6.1: a server that does not support the client's version
/// answers with Version Negotiation and keeps no state.
#[test]
fn test_rfc9000_unsupported_version_gets_negotiation_and_no_state() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut client = client_with_version(5000, UNSUPPORTED_VERSION);

    let initial = next_datagram(&mut client);
    let outcome = dispatch(&mut dispatcher, &mut registry, &initial, client.local());

    let Dispatch::Negotiate(mut reply) = outcome else {
        panic!("expected version negotiation, got {:?}", outcome);
    };
    assert!(registry.is_empty());

    let sent = Header::from_slice(&initial, 20).unwrap();
    let vn = Header::from_slice(&reply, 20).unwrap();
    assert_eq!(vn.ty, PacketType::VersionNegotiation);
    assert_eq!(vn.dcid, sent.scid);
    assert_eq!(vn.scid, sent.dcid);
    assert!(vn.versions.unwrap().contains(&VERSION_1));

    client.recv(&mut reply, server_addr()).unwrap();
    assert_eq!(client.engine().version(), VERSION_1);
}

/// The negotiated client completes the handshake on the next attempt.
#[test]
fn test_negotiated_client_connects() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut client = client_with_version(5001, UNSUPPORTED_VERSION);

    pump(&mut client, &mut dispatcher, &mut registry);

    assert!(client.is_established());
    assert_eq!(registry.len(), 1);
}

/// RFC 8999 Section 5.1: for an unknown version only the header form,
/// version and connection IDs are defined, so neither the fixed bit nor the
/// type bits keep a datagram from being negotiated.
#[test]
fn test_rfc8999_unknown_version_negotiated_regardless_of_type_bits() {
    let dcid = [0xd1; 8];
    let scid = [0x5c; 8];
    for first in [0xc0u8, 0xf0, 0x80, 0xb0] {
        let mut dispatcher = dispatcher(DispatchOptions::default());
        let mut registry = ConnectionRegistry::new();
        // 0xff would be an oversized token length under version 1 rules
        let datagram = long_header(first, UNSUPPORTED_VERSION, &dcid, &scid, &[0xff; 8]);

        let outcome = dispatch(&mut dispatcher, &mut registry, &datagram, client_addr(5020));
        let Dispatch::Negotiate(reply) = outcome else {
            panic!("first byte {:#04x}: expected version negotiation, got {:?}", first, outcome);
        };
        assert!(registry.is_empty());

        let vn = Header::from_slice(&reply, 20).unwrap();
        assert_eq!(vn.ty, PacketType::VersionNegotiation);
        assert_eq!(vn.dcid.as_bytes(), &scid);
        assert_eq!(vn.scid.as_bytes(), &dcid);
    }
}

/// Under a supported version, a clear fixed bit is still malformed and a
/// Retry sent to the server is not answered.
#[test]
fn test_supported_version_keeps_type_rules() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();

    let no_fixed_bit = long_header(0x80, VERSION_1, &[1; 8], &[2; 8], &[0]);
    let outcome = dispatch(&mut dispatcher, &mut registry, &no_fixed_bit, client_addr(5021));
    assert_eq!(outcome, Dispatch::Dropped(DropReason::Malformed));

    let retry = long_header(0xf0, VERSION_1, &[1; 8], &[2; 8], &[0]);
    let outcome = dispatch(&mut dispatcher, &mut registry, &retry, client_addr(5021));
    assert_eq!(outcome, Dispatch::Dropped(DropReason::UnknownConnection));
    assert!(registry.is_empty());
}

// ============================================================================
// RFC 9000 Section 8.1 - Address Validation
// ============================================================================

/// RFC 9000 Section 8.1.2: an Initial without a token is answered with Retry
/// and creates no state; the retried Initial creates exactly one connection.
#[test]
fn test_rfc9000_retry_then_single_accept() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5002);

    let first = next_datagram(&mut client);
    let outcome = dispatch(&mut dispatcher, &mut registry, &first, client.local());
    let Dispatch::Retry(mut reply) = outcome else {
        panic!("expected retry, got {:?}", outcome);
    };
    assert!(registry.is_empty());

    let retry = Header::from_slice(&reply, 20).unwrap();
    assert_eq!(retry.ty, PacketType::Retry);
    assert!(retry.has_token());
    let new_scid = retry.scid.clone();
    assert_eq!(new_scid.len(), CID_LENGTH);

    client.recv(&mut reply, server_addr()).unwrap();
    let second = next_datagram(&mut client);
    let hdr = Header::from_slice(&second, 20).unwrap();
    assert_eq!(hdr.dcid, new_scid);
    assert_eq!(hdr.token, retry.token);

    let outcome = dispatch(&mut dispatcher, &mut registry, &second, client.local());
    assert_eq!(outcome, Dispatch::Accepted(new_scid.clone()));
    assert_eq!(registry.len(), 1);

    let conn = registry.get(new_scid.as_bytes()).unwrap();
    assert_eq!(conn.source_id(), &new_scid);
    assert_eq!(conn.engine().odcid(), Some(&Header::from_slice(&first, 20).unwrap().dcid));

    // A duplicate of the retried Initial is routed, not accepted again
    let outcome = dispatch(&mut dispatcher, &mut registry, &second, client.local());
    assert_eq!(outcome, Dispatch::Routed(new_scid));
    assert_eq!(registry.len(), 1);
}

/// RFC 9000 Section 8.1.3: a token only validates from the address it was
/// issued to. The failure produces no reply.
#[test]
fn test_rfc9000_token_from_other_address_is_dropped() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5003);

    let first = next_datagram(&mut client);
    let Dispatch::Retry(mut reply) = dispatch(&mut dispatcher, &mut registry, &first, client.local())
    else {
        panic!("expected retry");
    };
    client.recv(&mut reply, server_addr()).unwrap();
    let second = next_datagram(&mut client);

    let outcome = dispatch(&mut dispatcher, &mut registry, &second, client_addr(6000));
    assert_eq!(outcome, Dispatch::Dropped(DropReason::InvalidToken));
    assert!(registry.is_empty());
}

#[test]
fn test_token_from_other_server_is_dropped() {
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5004);

    let first = next_datagram(&mut client);
    let mut issuer = dispatcher(DispatchOptions::default());
    let Dispatch::Retry(mut reply) = dispatch(&mut issuer, &mut registry, &first, client.local())
    else {
        panic!("expected retry");
    };
    client.recv(&mut reply, server_addr()).unwrap();
    let second = next_datagram(&mut client);

    let config = SimEngine::configure(&TransportSettings::default()).unwrap();
    let mut other = PacketDispatcher::<SimEngine>::new(
        config,
        server_addr(),
        TokenService::with_key(99, 99),
        Box::new(SequentialConnectionIdGenerator::new(1)),
        DerivedConnectionIds::with_key(33, 44),
        DispatchOptions::default(),
    );
    let outcome = dispatch(&mut other, &mut registry, &second, client.local());
    assert_eq!(outcome, Dispatch::Dropped(DropReason::InvalidToken));
    assert!(registry.is_empty());
}

/// A valid token only opens a connection under the ID its Retry handed out;
/// the client cannot pick the registered ID or its length.
#[test]
fn test_token_on_other_destination_id_is_dropped() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut client = client(6001);

    let first = next_datagram(&mut client);
    let Dispatch::Retry(reply) = dispatch(&mut dispatcher, &mut registry, &first, client.local())
    else {
        panic!("expected retry");
    };
    let retry = Header::from_slice(&reply, 20).unwrap();
    let token = retry.token.unwrap();

    let mut rest = Vec::new();
    varint::encode(token.len() as u64, &mut rest).unwrap();
    rest.extend_from_slice(&token);
    let chosen = [1u8, 2, 3, 4];
    let forged = long_header(0xc0, VERSION_1, &chosen, client.source_id().as_bytes(), &rest);

    let outcome = dispatch(&mut dispatcher, &mut registry, &forged, client.local());
    assert_eq!(outcome, Dispatch::Dropped(DropReason::InvalidToken));
    assert!(registry.is_empty());
    assert!(!registry.contains(&chosen[..]));
}

// ============================================================================
// Retry disabled
// ============================================================================

#[test]
fn test_no_retry_accepts_first_initial() {
    let mut dispatcher = dispatcher(no_retry());
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5005);

    let initial = next_datagram(&mut client);
    let outcome = dispatch(&mut dispatcher, &mut registry, &initial, client.local());
    let Dispatch::Accepted(scid) = outcome else {
        panic!("expected accept, got {:?}", outcome);
    };
    assert_eq!(scid.len(), CID_LENGTH);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get(scid.as_bytes()).unwrap().engine().odcid(), None);

    // Retransmitted Initial lands on the same connection
    let outcome = dispatch(&mut dispatcher, &mut registry, &initial, client.local());
    assert_eq!(outcome, Dispatch::Routed(scid));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_no_retry_handshake_completes() {
    let mut dispatcher = dispatcher(no_retry());
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5006);

    pump(&mut client, &mut dispatcher, &mut registry);

    assert!(client.is_established());
    assert!(registry.iter().all(|c| c.is_established()));
}

// ============================================================================
// RFC 9000 Section 5.2 - Matching packets to connections
// ============================================================================

/// RFC 9000 Section 5.2: packets are matched by destination connection ID,
/// never by address, and never delivered to another connection.
#[test]
fn test_rfc9000_datagrams_reach_only_their_connection() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut a = client(5007);
    let mut b = client(5008);

    pump(&mut a, &mut dispatcher, &mut registry);
    pump(&mut b, &mut dispatcher, &mut registry);
    assert_eq!(registry.len(), 2);
    assert!(a.is_established() && b.is_established());

    a.stream_send(4, b"GET /a\r\n", true).unwrap();
    let datagram = next_datagram(&mut a);
    let Dispatch::Routed(target) = dispatch(&mut dispatcher, &mut registry, &datagram, a.local())
    else {
        panic!("expected routing");
    };

    for conn in registry.iter_mut() {
        let readable = conn.next_readable_stream();
        if conn.source_id() == &target {
            assert_eq!(readable, Some(4));
        } else {
            assert_eq!(readable, None);
        }
    }
}

/// RFC 9000 Section 9: a connection keeps its ID when the client's address
/// changes; the datagram is still routed by ID.
#[test]
fn test_routing_ignores_source_address() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut a = client(5009);
    pump(&mut a, &mut dispatcher, &mut registry);

    a.stream_send(4, b"GET /\r\n", true).unwrap();
    let datagram = next_datagram(&mut a);
    let moved = client_addr(7000);
    let outcome = dispatch(&mut dispatcher, &mut registry, &datagram, moved);
    let Dispatch::Routed(scid) = outcome else {
        panic!("expected routing, got {:?}", outcome);
    };
    assert_eq!(registry.get(scid.as_bytes()).unwrap().peer(), moved);
}

// ============================================================================
// Drops
// ============================================================================

#[test]
fn test_malformed_datagram_is_dropped() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let outcome = dispatch(&mut dispatcher, &mut registry, &[0xc0, 0x00], client_addr(1));
    assert_eq!(outcome, Dispatch::Dropped(DropReason::Malformed));
    assert!(registry.is_empty());
}

/// RFC 9000 Section 5.2.2: short header packets cannot open a connection.
#[test]
fn test_rfc9000_short_header_for_unknown_connection_is_dropped() {
    let mut dispatcher = dispatcher(DispatchOptions::default());
    let mut registry = ConnectionRegistry::new();
    let mut datagram = vec![0x43];
    datagram.extend_from_slice(&[7u8; 20]);
    datagram.extend_from_slice(&[0u8; 30]);

    let outcome = dispatch(&mut dispatcher, &mut registry, &datagram, client_addr(1));
    assert_eq!(outcome, Dispatch::Dropped(DropReason::UnknownConnection));
}

/// RFC 9000 Section 14.1: Initial datagrams below the minimum size are
/// discarded, even for versions the server would negotiate.
#[test]
fn test_rfc9000_undersized_initial_is_dropped() {
    let mut dispatcher = dispatcher(DispatchOptions {
        retry: true,
        min_initial_size: 1300,
    });
    let mut registry = ConnectionRegistry::new();

    let mut supported = client(5010);
    let initial = next_datagram(&mut supported);
    let outcome = dispatch(&mut dispatcher, &mut registry, &initial, supported.local());
    assert_eq!(outcome, Dispatch::Dropped(DropReason::TooSmall));

    let mut unsupported = client_with_version(5011, UNSUPPORTED_VERSION);
    let initial = next_datagram(&mut unsupported);
    let outcome = dispatch(&mut dispatcher, &mut registry, &initial, unsupported.local());
    assert_eq!(outcome, Dispatch::Dropped(DropReason::TooSmall));
}

#[test]
fn test_minimum_size_admits_full_initial() {
    let mut dispatcher = dispatcher(DispatchOptions {
        retry: true,
        min_initial_size: 1200,
    });
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5012);
    let initial = next_datagram(&mut client);
    assert!(matches!(
        dispatch(&mut dispatcher, &mut registry, &initial, client.local()),
        Dispatch::Retry(_)
    ));
}

#[test]
fn test_random_datagrams_never_create_state() {
    proptest!(|(datagram in proptest::collection::vec(any::<u8>(), 0..1300))| {
        let mut dispatcher = dispatcher(DispatchOptions::default());
        let mut registry = ConnectionRegistry::new();
        let mut buf = datagram.clone();
        let outcome = dispatcher.dispatch(&mut registry, &mut buf, client_addr(1)).unwrap();
        prop_assert!(registry.is_empty());
        prop_assert!(!matches!(outcome, Dispatch::Accepted(_) | Dispatch::Routed(_)));
    });
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_registry_rejects_duplicate_ids() {
    let mut config = SimEngine::configure(&TransportSettings::default()).unwrap();
    let scid = ConnectionId::from_slice(&[1; 20]).unwrap();
    let mut registry = ConnectionRegistry::new();

    let first =
        Connection::<SimEngine>::accept(&mut config, scid.clone(), None, server_addr(), client_addr(1)).unwrap();
    let second =
        Connection::<SimEngine>::accept(&mut config, scid.clone(), None, server_addr(), client_addr(2)).unwrap();

    assert!(registry.insert(first).is_ok());
    let rejected = registry.insert(second).unwrap_err();
    assert_eq!(rejected.peer(), client_addr(2));
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(scid.as_bytes()));
}

#[test]
fn test_sweep_removes_only_closed() {
    let settings = TransportSettings {
        idle_timeout_ms: 1,
        ..Default::default()
    };
    let mut dispatcher = {
        let config = SimEngine::configure(&settings).unwrap();
        PacketDispatcher::<SimEngine>::new(
            config,
            server_addr(),
            TokenService::with_key(1, 1),
            Box::new(SequentialConnectionIdGenerator::new(1)),
            DerivedConnectionIds::with_key(1, 1),
            no_retry(),
        )
    };
    let mut registry = ConnectionRegistry::new();
    let mut client = client(5013);
    let initial = next_datagram(&mut client);
    let Dispatch::Accepted(idle) = dispatch(&mut dispatcher, &mut registry, &initial, client.local())
    else {
        panic!("expected accept");
    };

    let mut config = SimEngine::configure(&TransportSettings::default()).unwrap();
    let fresh = ConnectionId::from_slice(&[9; 20]).unwrap();
    let other =
        Connection::<SimEngine>::accept(&mut config, fresh.clone(), None, server_addr(), client_addr(9)).unwrap();
    registry.insert(other).unwrap();

    assert!(registry.sweep_closed().is_empty());

    std::thread::sleep(std::time::Duration::from_millis(5));
    for conn in registry.iter_mut() {
        conn.on_timeout();
    }

    let reaped = registry.sweep_closed();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].scid, idle);
    assert_eq!(reaped[0].peer, client.local());
    assert!(reaped[0].stats.recv >= 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(fresh.as_bytes()));
}
