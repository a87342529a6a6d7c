//! Drives the full decode -> dispatch -> encode pipeline with the literal
//! wire scenarios from the spec (no sockets — the event loop's own
//! responsibility is just shuttling these same bytes to/from a `TcpStream`,
//! exercised separately by the unit tests in `src/event_loop.rs`'s sibling
//! modules).

use bytes::BytesMut;

use kvrs::config::Config;
use kvrs::connection::Connection;
use kvrs::dispatcher::handle_frame;
use kvrs::resp::decode_command;
use kvrs::server::Server;

fn server() -> Server {
    Server::new(Config { dir: "/tmp".into(), dbfilename: "dump.rdb".into(), port: 6379 })
}

fn connect(server: &mut Server, id: usize) {
    server.connections.insert(id, Connection::new(id));
}

/// Feeds raw wire bytes through the real decoder, dispatches the resulting
/// frame, and returns whatever bytes accumulated in the connection's write
/// buffer.
fn roundtrip(server: &mut Server, conn_id: usize, wire: &[u8], now_ms: u64) -> Vec<u8> {
    let mut buf = BytesMut::from(wire);
    let tokens = decode_command(&mut buf).unwrap().expect("complete frame");
    handle_frame(server, conn_id, tokens, now_ms);
    let conn = server.connections.get_mut(&conn_id).unwrap();
    std::mem::take(&mut conn.write_buf)
}

#[test]
fn ping() {
    let mut s = server();
    connect(&mut s, 1);
    assert_eq!(roundtrip(&mut s, 1, b"*1\r\n$4\r\nPING\r\n", 0), b"+PONG\r\n");
}

#[test]
fn echo() {
    let mut s = server();
    connect(&mut s, 1);
    assert_eq!(roundtrip(&mut s, 1, b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n", 0), b"$5\r\nhello\r\n");
}

#[test]
fn set_get_with_ttl_over_the_wire() {
    let mut s = server();
    connect(&mut s, 1);
    let set = b"*5\r\n$3\r\nSET\r\n$1\r\nx\r\n$3\r\n100\r\n$2\r\nPX\r\n$2\r\n50\r\n";
    assert_eq!(roundtrip(&mut s, 1, set, 0), b"+OK\r\n");

    let get = b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n";
    assert_eq!(roundtrip(&mut s, 1, get, 0), b"$3\r\n100\r\n");
    assert_eq!(roundtrip(&mut s, 1, get, 60), b"$-1\r\n");
}

#[test]
fn incr_new_then_existing_then_non_integer() {
    let mut s = server();
    connect(&mut s, 1);
    let incr = b"*2\r\n$4\r\nINCR\r\n$7\r\ncounter\r\n";
    assert_eq!(roundtrip(&mut s, 1, incr, 0), b":1\r\n");
    assert_eq!(roundtrip(&mut s, 1, incr, 0), b":2\r\n");

    roundtrip(&mut s, 1, b"*3\r\n$3\r\nSET\r\n$7\r\ncounter\r\n$3\r\nabc\r\n", 0);
    assert_eq!(roundtrip(&mut s, 1, incr, 0), b"-ERR value is not an integer or out of range\r\n");
}

#[test]
fn stream_append_and_blocking_read_woken_across_connections() {
    let mut s = server();
    connect(&mut s, 1); // writer
    connect(&mut s, 2); // reader

    let first_add = b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-1\r\n$11\r\ntemperature\r\n$2\r\n36\r\n";
    assert_eq!(roundtrip(&mut s, 1, first_add, 0), b"$3\r\n1-1\r\n");

    let block = b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$1\r\n0\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$1\r\n$\r\n";
    let reply = roundtrip(&mut s, 2, block, 0);
    assert!(reply.is_empty(), "a blocking XREAD with no match yet writes nothing");
    assert!(s.connections[&2].is_blocked());

    let second_add = b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-2\r\n$11\r\ntemperature\r\n$2\r\n37\r\n";
    assert_eq!(roundtrip(&mut s, 1, second_add, 0), b"$3\r\n1-2\r\n");

    assert!(!s.connections[&2].is_blocked());
    let woken = std::mem::take(&mut s.connections.get_mut(&2).unwrap().write_buf);
    assert_eq!(
        woken,
        b"*1\r\n*2\r\n$1\r\ns\r\n*1\r\n*2\r\n$3\r\n1-2\r\n*2\r\n$11\r\ntemperature\r\n$2\r\n37\r\n".to_vec()
    );
}

#[test]
fn transaction_over_the_wire() {
    let mut s = server();
    connect(&mut s, 1);
    assert_eq!(roundtrip(&mut s, 1, b"*1\r\n$5\r\nMULTI\r\n", 0), b"+OK\r\n");
    assert_eq!(roundtrip(&mut s, 1, b"*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n", 0), b"+QUEUED\r\n");
    assert_eq!(roundtrip(&mut s, 1, b"*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n", 0), b"+QUEUED\r\n");
    assert_eq!(roundtrip(&mut s, 1, b"*1\r\n$4\r\nEXEC\r\n", 0), b"*2\r\n:1\r\n:2\r\n");
}

#[test]
fn xrange_round_trips_a_freshly_appended_entry() {
    let mut s = server();
    connect(&mut s, 1);
    let add = b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$1\r\n*\r\n$1\r\nf\r\n$1\r\nv\r\n";
    let id_reply = roundtrip(&mut s, 1, add, 42);
    assert_eq!(id_reply, b"$4\r\n42-0\r\n");

    let range = b"*4\r\n$6\r\nXRANGE\r\n$1\r\ns\r\n$4\r\n42-0\r\n$4\r\n42-0\r\n";
    assert_eq!(roundtrip(&mut s, 1, range, 42), b"*1\r\n*2\r\n$4\r\n42-0\r\n*2\r\n$1\r\nf\r\n$1\r\nv\r\n".to_vec());
}

#[test]
fn protocol_violation_is_reported_and_would_close_the_connection() {
    let mut buf = BytesMut::from(&b"not-resp\r\n"[..]);
    assert!(decode_command(&mut buf).is_err());
}

#[test]
fn config_get_reports_both_recognized_parameters() {
    let mut s = server();
    connect(&mut s, 1);
    let cmd = b"*3\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n$3\r\ndir\r\n";
    assert_eq!(roundtrip(&mut s, 1, cmd, 0), b"*2\r\n$3\r\ndir\r\n$4\r\n/tmp\r\n");
}
