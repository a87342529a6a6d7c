//! Single-threaded, non-blocking, readiness-based I/O loop (spec §4.8, §5).
//!
//! One `mio::Poll` multiplexes the listening socket and every client
//! socket. All store mutation happens synchronously inside a single
//! `dispatcher::handle_frame` call, so there is never a partial state
//! observable between two commands (spec §5's serialization argument).

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{ConnId, Connection, ConnectionMode};
use crate::dispatcher;
use crate::resp::{self, Resp};
use crate::server::Server;
use crate::snapshot;

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Bound on how many expiration-table entries the tick proactively sweeps
/// each iteration (spec §4.8 step 4 — lazy purge at access stays
/// authoritative; this just bounds how long an unread key lingers).
const EXPIRATION_SWEEP_BUDGET: usize = 20;
/// Above this many buffered-but-unwritten bytes, a connection stops being
/// polled for readability until its write buffer drains (spec §5's
/// "shared-resource policy" backpressure note).
const HIGH_WATER_MARK: usize = 1 << 20;

/// Binds the listener, loads the snapshot, and runs the loop until a fatal
/// I/O error. Never returns on a clean shutdown path — there is none; the
/// process is killed externally, matching spec §6's exit-code contract
/// (0 only applies to a clean shutdown the loop itself doesn't initiate).
pub fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("127.0.0.1:{}", config.port).parse()?;
    let mut listener = TcpListener::bind(addr)?;
    info!(port = config.port, "listening");

    let mut poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut server = Server::new(config.clone());
    load_snapshot(&mut server, &config)?;

    let mut sockets: HashMap<Token, TcpStream> = HashMap::new();
    let mut next_token = 1usize;
    let mut events = Events::with_capacity(1024);
    let start = Instant::now();

    loop {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        for event in events.iter() {
            if event.token() == LISTENER {
                accept_all(&mut poll, &mut listener, &mut sockets, &mut server, &mut next_token);
                continue;
            }

            let token = event.token();
            let conn_id: ConnId = token.0;
            if !sockets.contains_key(&token) {
                // Stale event for a connection already dropped earlier in
                // this same readiness batch.
                continue;
            }

            let mut eof_or_err = false;
            if event.is_readable() {
                eof_or_err = !read_ready(&mut sockets, &mut server, token, start);
            }

            flush_writes(&mut poll, &mut sockets, &mut server, token);

            let closing_drained = server
                .connections
                .get(&conn_id)
                .map_or(true, |c| c.closing && c.write_buf.is_empty());

            if eof_or_err || closing_drained {
                disconnect(&mut poll, &mut sockets, &mut server, token);
            }
        }

        tick(&mut poll, &mut sockets, &mut server, start);
    }
}

fn load_snapshot(server: &mut Server, config: &Config) -> anyhow::Result<()> {
    let path = config.snapshot_path();
    let wall_now = snapshot::wall_clock_now_ms();
    match snapshot::load_into(&mut server.strings, &path, wall_now, 0) {
        Ok(Some(stats)) => {
            info!(
                path = %path.display(),
                loaded = stats.loaded,
                dropped_expired = stats.dropped_expired,
                "snapshot loaded"
            );
            Ok(())
        }
        Ok(None) => {
            info!(path = %path.display(), "no snapshot file, starting empty");
            Ok(())
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "fatal: snapshot could not be loaded");
            Err(e)
        }
    }
}

fn accept_all(
    poll: &mut Poll,
    listener: &mut TcpListener,
    sockets: &mut HashMap<Token, TcpStream>,
    server: &mut Server,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                let token = Token(*next_token);
                *next_token += 1;
                if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE) {
                    warn!(error = %e, "failed to register accepted connection");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                sockets.insert(token, stream);
                server.connections.insert(token.0, Connection::new(token.0));
                debug!(conn = token.0, %addr, "accepted connection");
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Reads everything currently available on `token`'s socket into its
/// connection buffer, dispatching every complete command found along the
/// way. Returns `false` on EOF or a fatal I/O error (caller disconnects).
fn read_ready(sockets: &mut HashMap<Token, TcpStream>, server: &mut Server, token: Token, start: Instant) -> bool {
    let conn_id = token.0;
    let mut buf = [0u8; 4096];
    loop {
        let Some(stream) = sockets.get_mut(&token) else { return false };
        match stream.read(&mut buf) {
            Ok(0) => return false,
            Ok(n) => {
                match server.connections.get_mut(&conn_id) {
                    Some(conn) => conn.read_buf.extend_from_slice(&buf[..n]),
                    None => return false,
                }
                drain_commands(server, conn_id, start);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(conn = conn_id, error = %e, "read failed");
                return false;
            }
        }
    }
}

/// Drains every fully-buffered command off `conn_id`'s read buffer,
/// stopping at the first partial command (retained for the next read) or
/// protocol violation (the connection is marked `closing`, spec §7(a)).
fn drain_commands(server: &mut Server, conn_id: ConnId, start: Instant) {
    let now_ms = start.elapsed().as_millis() as u64;
    loop {
        let tokens = {
            let Some(conn) = server.connections.get_mut(&conn_id) else { return };
            match resp::decode_command(&mut conn.read_buf) {
                Ok(Some(tokens)) => tokens,
                Ok(None) => return,
                Err(e) => {
                    warn!(conn = conn_id, "protocol error, closing connection");
                    conn.queue_reply(&Resp::from(e).to_bytes());
                    conn.closing = true;
                    return;
                }
            }
        };
        dispatcher::handle_frame(server, conn_id, tokens, now_ms);
    }
}

/// Writes as much of `token`'s pending reply bytes as the socket accepts
/// right now, then reregisters its readiness interest to reflect whether
/// more writes are pending (spec §5's write-buffer / backpressure note).
fn flush_writes(poll: &mut Poll, sockets: &mut HashMap<Token, TcpStream>, server: &mut Server, token: Token) {
    let conn_id = token.0;
    loop {
        let Some(conn) = server.connections.get_mut(&conn_id) else { return };
        if conn.write_buf.is_empty() {
            break;
        }
        let Some(stream) = sockets.get_mut(&token) else { return };
        match stream.write(&conn.write_buf) {
            Ok(0) => break,
            Ok(n) => conn.write_buf.drain(0..n).for_each(drop),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(conn = conn_id, error = %e, "write failed");
                conn.closing = true;
                break;
            }
        }
    }
    sync_interest(poll, sockets, server, token);
}

fn sync_interest(poll: &mut Poll, sockets: &mut HashMap<Token, TcpStream>, server: &Server, token: Token) {
    let Some(conn) = server.connections.get(&token.0) else { return };
    let Some(stream) = sockets.get_mut(&token) else { return };
    let interest = if conn.write_buf.len() > HIGH_WATER_MARK {
        Interest::WRITABLE
    } else if conn.write_buf.is_empty() {
        Interest::READABLE
    } else {
        Interest::READABLE | Interest::WRITABLE
    };
    let _ = poll.registry().reregister(stream, token, interest);
}

fn disconnect(poll: &mut Poll, sockets: &mut HashMap<Token, TcpStream>, server: &mut Server, token: Token) {
    let conn_id = token.0;
    if let Some(mut stream) = sockets.remove(&token) {
        let _ = poll.registry().deregister(&mut stream);
    }
    server.connections.remove(&conn_id);
    server.blocking.deregister(conn_id);
    debug!(conn = conn_id, "connection closed");
}

/// Once per loop iteration: fire blocking-read timeouts and opportunistically
/// sweep a bounded slice of expired string keys (spec §4.8 step 4).
fn tick(poll: &mut Poll, sockets: &mut HashMap<Token, TcpStream>, server: &mut Server, start: Instant) {
    let now_ms = start.elapsed().as_millis() as u64;

    let timed_out = server.blocking.take_due_timeouts(now_ms);
    let mut touched: Vec<ConnId> = Vec::with_capacity(timed_out.len());
    for waiter in timed_out {
        if let Some(conn) = server.connections.get_mut(&waiter.conn_id) {
            conn.queue_reply(&Resp::NullBulk.to_bytes());
            conn.mode = ConnectionMode::Normal;
            touched.push(waiter.conn_id);
        }
    }

    server.strings.sweep_expired(now_ms, EXPIRATION_SWEEP_BUDGET);

    for conn_id in touched {
        let token = Token(conn_id);
        if sockets.contains_key(&token) {
            flush_writes(poll, sockets, server, token);
        }
    }
}
