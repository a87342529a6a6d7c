//! Maps a decoded command to an executor, applying the per-connection
//! gating spec §4.6 describes: execute immediately, enqueue into a
//! transaction queue, or transition the connection into a blocked state.

use tracing::debug;

use crate::blocking::BlockingWaiter;
use crate::command::{self, Command, CommandLine};
use crate::connection::{ConnId, ConnectionMode, TxnState};
use crate::error::CommandError;
use crate::resp::Resp;
use crate::server::Server;
use crate::store::{StreamEntry, StreamEntryId, StreamStore};

/// The outcome of executing a single command line.
enum Execution {
    Reply(Resp),
    /// The connection registered a `BlockingWaiter` and is now parked;
    /// nothing is written yet.
    Blocked,
}

/// Entry point called by the event loop once per fully decoded frame.
pub fn handle_frame(server: &mut Server, conn_id: ConnId, tokens: Vec<Vec<u8>>, now_ms: u64) {
    if tokens.is_empty() {
        write_reply(server, conn_id, Resp::from(CommandError::Protocol));
        return;
    }

    let is_queuing = matches!(
        server.connections.get(&conn_id).map(|c| &c.mode),
        Some(ConnectionMode::Queuing(_))
    );
    let head = String::from_utf8_lossy(&tokens[0]).to_ascii_uppercase();

    // MULTI/EXEC/DISCARD manage transaction state itself and are never
    // queued, even while already queuing (spec §4.5).
    match head.as_str() {
        "MULTI" => return handle_multi(server, conn_id),
        "EXEC" => return handle_exec(server, conn_id, now_ms),
        "DISCARD" => return handle_discard(server, conn_id),
        _ => {}
    }

    if is_queuing {
        // Simplified policy (spec §4.5): every command is accepted into the
        // queue unparsed; validation happens only at EXEC time.
        if let Some(conn) = server.connections.get_mut(&conn_id) {
            if let ConnectionMode::Queuing(txn) = &mut conn.mode {
                txn.queue.push(tokens);
            }
        }
        write_reply(server, conn_id, Resp::Simple("QUEUED".to_string()));
        return;
    }

    let line = match command::parse(tokens) {
        Ok(l) => l,
        Err(e) => return write_reply(server, conn_id, Resp::from(e)),
    };
    debug!(conn = conn_id, command = line.command.name(), "dispatching command");
    match execute(server, conn_id, line, now_ms, true) {
        Execution::Reply(resp) => write_reply(server, conn_id, resp),
        Execution::Blocked => {}
    }
}

fn write_reply(server: &mut Server, conn_id: ConnId, resp: Resp) {
    if let Some(conn) = server.connections.get_mut(&conn_id) {
        conn.queue_reply(&resp.to_bytes());
    }
}

fn handle_multi(server: &mut Server, conn_id: ConnId) {
    let Some(conn) = server.connections.get_mut(&conn_id) else { return };
    match &conn.mode {
        ConnectionMode::Queuing(_) => {
            conn.queue_reply(&Resp::from(CommandError::NestedMulti).to_bytes());
        }
        _ => {
            conn.mode = ConnectionMode::Queuing(TxnState::default());
            conn.queue_reply(&Resp::ok().to_bytes());
        }
    }
}

fn handle_discard(server: &mut Server, conn_id: ConnId) {
    let Some(conn) = server.connections.get_mut(&conn_id) else { return };
    match conn.mode {
        ConnectionMode::Queuing(_) => {
            conn.mode = ConnectionMode::Normal;
            conn.queue_reply(&Resp::ok().to_bytes());
        }
        _ => conn.queue_reply(&Resp::from(CommandError::DiscardWithoutMulti).to_bytes()),
    }
}

fn handle_exec(server: &mut Server, conn_id: ConnId, now_ms: u64) {
    let queue = {
        let Some(conn) = server.connections.get_mut(&conn_id) else { return };
        match std::mem::replace(&mut conn.mode, ConnectionMode::Normal) {
            ConnectionMode::Queuing(txn) => Some(txn.queue),
            other => {
                conn.mode = other;
                None
            }
        }
    };

    let Some(queue) = queue else {
        return write_reply(server, conn_id, Resp::from(CommandError::ExecWithoutMulti));
    };

    // Single-threaded loop: no other connection's commands can interleave
    // with this FIFO replay (spec §4.5, §5).
    let mut replies = Vec::with_capacity(queue.len());
    for tokens in queue {
        let reply = match command::parse(tokens) {
            Ok(line) => match execute(server, conn_id, line, now_ms, false) {
                Execution::Reply(r) => r,
                // allow_block=false means XREAD never returns Blocked here.
                Execution::Blocked => Resp::Array(vec![]),
            },
            Err(e) => Resp::from(e),
        };
        replies.push(reply);
    }
    write_reply(server, conn_id, Resp::Array(replies));
}

/// Runs one already-parsed command line. `allow_block` is false while
/// replaying a transaction's queue, per spec §9's open-question resolution:
/// XREAD never blocks inside MULTI.
fn execute(server: &mut Server, conn_id: ConnId, line: CommandLine, now_ms: u64, allow_block: bool) -> Execution {
    let CommandLine { command, args } = line;
    match command {
        Command::Xread => return cmd_xread(server, conn_id, &args, now_ms, allow_block),
        Command::Multi | Command::Exec | Command::Discard => {
            unreachable!("transaction control is intercepted before execute()")
        }
        _ => {}
    }

    let result = match command {
        Command::Ping => cmd_ping(&args),
        Command::Echo => cmd_echo(&args),
        Command::Set => cmd_set(server, &args, now_ms),
        Command::Get => cmd_get(server, &args, now_ms),
        Command::Incr => cmd_incr(server, &args, now_ms),
        Command::Type => cmd_type(server, &args, now_ms),
        Command::Keys => cmd_keys(server, &args, now_ms),
        Command::Config => cmd_config(server, &args),
        Command::Xadd => cmd_xadd(server, &args, now_ms),
        Command::Xrange => cmd_xrange(server, &args, now_ms),
        Command::Xread | Command::Multi | Command::Exec | Command::Discard => unreachable!(),
    };
    Execution::Reply(result.unwrap_or_else(Resp::from))
}

fn cmd_ping(args: &[Vec<u8>]) -> Result<Resp, CommandError> {
    match args {
        [] => Ok(Resp::Simple("PONG".to_string())),
        [msg] => Ok(Resp::bulk(msg.clone())),
        _ => Err(CommandError::WrongArity("ping".into())),
    }
}

fn cmd_echo(args: &[Vec<u8>]) -> Result<Resp, CommandError> {
    match args {
        [msg] => Ok(Resp::bulk(msg.clone())),
        _ => Err(CommandError::WrongArity("echo".into())),
    }
}

fn cmd_set(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [key, value] => {
            server.strings.set(key.clone(), value.clone(), None, now_ms);
            Ok(Resp::ok())
        }
        [key, value, options @ ..] => {
            let ttl_ms = parse_ttl_option(options)?;
            server.strings.set(key.clone(), value.clone(), ttl_ms, now_ms);
            Ok(Resp::ok())
        }
        _ => Err(CommandError::WrongArity("set".into())),
    }
}

/// `PX ms` or `EX seconds`, per spec §4.2's `ttl_ms?` option (both forms
/// are what real clients actually send; the spec's literal scenarios only
/// exercise `PX`).
fn parse_ttl_option(options: &[Vec<u8>]) -> Result<Option<u64>, CommandError> {
    let mut i = 0;
    while i < options.len() {
        if options[i].eq_ignore_ascii_case(b"PX") {
            let raw = options.get(i + 1).ok_or(CommandError::Syntax)?;
            return parse_u64(raw).map(Some);
        }
        if options[i].eq_ignore_ascii_case(b"EX") {
            let raw = options.get(i + 1).ok_or(CommandError::Syntax)?;
            return parse_u64(raw).map(|secs| Some(secs * 1000));
        }
        i += 1;
    }
    Ok(None)
}

fn parse_u64(raw: &[u8]) -> Result<u64, CommandError> {
    std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()).ok_or(CommandError::Syntax)
}

/// A key that only exists in the other family's store is a type mismatch,
/// not an absent key — matches real Redis's `WRONGTYPE` reply (the string
/// and stream stores are independent maps, spec §3, so nothing else
/// enforces this).
fn reject_if_wrong_type(server: &Server, key: &[u8], in_string_family: bool) -> Result<(), CommandError> {
    let other_family_has_it = if in_string_family { server.streams.contains(key) } else { false };
    if other_family_has_it {
        Err(CommandError::WrongType)
    } else {
        Ok(())
    }
}

fn cmd_get(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [key] => {
            reject_if_wrong_type(server, key, true)?;
            Ok(server.strings.get(key, now_ms).map(|v| Resp::bulk(v.to_vec())).unwrap_or(Resp::NullBulk))
        }
        _ => Err(CommandError::WrongArity("get".into())),
    }
}

fn cmd_incr(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [key] => {
            reject_if_wrong_type(server, key, true)?;
            Ok(Resp::Integer(server.strings.incr(key, now_ms)?))
        }
        _ => Err(CommandError::WrongArity("incr".into())),
    }
}

fn cmd_type(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [key] => {
            let type_name = if server.strings.contains(key, now_ms) {
                "string"
            } else if server.streams.contains(key) {
                "stream"
            } else {
                "none"
            };
            Ok(Resp::Simple(type_name.to_string()))
        }
        _ => Err(CommandError::WrongArity("type".into())),
    }
}

fn cmd_keys(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [_pattern] => Ok(Resp::Array(server.strings.keys(now_ms).into_iter().map(Resp::bulk).collect())),
        _ => Err(CommandError::WrongArity("keys".into())),
    }
}

/// `CONFIG GET param [param ...]`, replying with the flat `[key, value,
/// key, value, ...]` array real Redis uses (spec §4.6; the two recognized
/// parameters are listed in SPEC_FULL's "Supplemented features"). Unknown
/// parameters are silently omitted, matching real `CONFIG GET`.
fn cmd_config(server: &Server, args: &[Vec<u8>]) -> Result<Resp, CommandError> {
    match args {
        [sub, params @ ..] if sub.eq_ignore_ascii_case(b"GET") && !params.is_empty() => {
            let mut out = Vec::new();
            for param in params {
                let value = match param.to_ascii_lowercase().as_slice() {
                    b"dir" => server.config.dir.to_string_lossy().into_owned(),
                    b"dbfilename" => server.config.dbfilename.clone(),
                    _ => continue,
                };
                out.push(Resp::bulk(param.clone()));
                out.push(Resp::bulk(value));
            }
            Ok(Resp::Array(out))
        }
        _ => Err(CommandError::Syntax),
    }
}

fn cmd_xadd(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [key, id, rest @ ..] if !rest.is_empty() && rest.len() % 2 == 0 => {
            if server.strings.contains(key, now_ms) {
                return Err(CommandError::WrongType);
            }
            let id_str = String::from_utf8_lossy(id).into_owned();
            let fields: Vec<(Vec<u8>, Vec<u8>)> = rest.chunks(2).map(|c| (c[0].clone(), c[1].clone())).collect();
            let new_id = server.streams.append(key, &id_str, fields, now_ms)?;
            server.wake_waiters(key);
            Ok(Resp::bulk(new_id.to_string()))
        }
        _ => Err(CommandError::WrongArity("xadd".into())),
    }
}

fn cmd_xrange(server: &mut Server, args: &[Vec<u8>], now_ms: u64) -> Result<Resp, CommandError> {
    match args {
        [key, start, end] => {
            if server.strings.contains(key, now_ms) {
                return Err(CommandError::WrongType);
            }
            let from = parse_range_bound(start, true)?;
            let to = parse_range_bound(end, false)?;
            let entries = server.streams.get(key).map(|s| s.range_inclusive(from, to)).unwrap_or_default();
            Ok(Resp::Array(entries.iter().map(|e| encode_stream_entry(e)).collect()))
        }
        _ => Err(CommandError::WrongArity("xrange".into())),
    }
}

/// A bare `ms` bound expands to `ms-0` on the start side and `ms-<MAX>` on
/// the end side (spec §4.3, §9's open-question resolution).
fn parse_range_bound(tok: &[u8], is_start: bool) -> Result<StreamEntryId, CommandError> {
    if tok == b"-" {
        return Ok(StreamEntryId::MIN);
    }
    if tok == b"+" {
        return Ok(StreamEntryId::MAX);
    }
    let s = std::str::from_utf8(tok).map_err(|_| CommandError::InvalidStreamId)?;
    match s.split_once('-') {
        Some((ms, seq)) => {
            let ms = ms.parse().map_err(|_| CommandError::InvalidStreamId)?;
            let seq = seq.parse().map_err(|_| CommandError::InvalidStreamId)?;
            Ok(StreamEntryId(ms, seq))
        }
        None => {
            let ms: u64 = s.parse().map_err(|_| CommandError::InvalidStreamId)?;
            Ok(StreamEntryId(ms, if is_start { 0 } else { u64::MAX }))
        }
    }
}

struct XreadRequest {
    block_ms: Option<u64>,
    streams: Vec<Vec<u8>>,
    since_tokens: Vec<Vec<u8>>,
}

fn parse_xread(args: &[Vec<u8>]) -> Result<XreadRequest, CommandError> {
    let mut i = 0;
    let mut block_ms = None;
    while i < args.len() {
        if args[i].eq_ignore_ascii_case(b"BLOCK") {
            let raw = args.get(i + 1).ok_or(CommandError::Syntax)?;
            block_ms = Some(parse_u64(raw)?);
            i += 2;
            continue;
        }
        if args[i].eq_ignore_ascii_case(b"STREAMS") {
            let rest = &args[i + 1..];
            if rest.is_empty() || rest.len() % 2 != 0 {
                return Err(CommandError::Syntax);
            }
            let (streams, since_tokens) = rest.split_at(rest.len() / 2);
            return Ok(XreadRequest {
                block_ms,
                streams: streams.to_vec(),
                since_tokens: since_tokens.to_vec(),
            });
        }
        i += 1;
    }
    Err(CommandError::Syntax)
}

/// Resolves each stream's `since-id` token, including `$` ("current tail at
/// call time", spec §4.3) against `server.streams` once, at command receipt.
fn resolve_watches(
    streams: &StreamStore,
    names: &[Vec<u8>],
    tokens: &[Vec<u8>],
) -> Result<Vec<(Vec<u8>, StreamEntryId)>, CommandError> {
    names
        .iter()
        .zip(tokens.iter())
        .map(|(name, tok)| {
            let since = if tok.as_slice() == b"$" {
                streams.current_tail(name)
            } else {
                std::str::from_utf8(tok)
                    .ok()
                    .and_then(|s| s.parse::<StreamEntryId>().ok())
                    .ok_or(CommandError::InvalidStreamId)?
            };
            Ok((name.clone(), since))
        })
        .collect()
}

fn cmd_xread(server: &mut Server, conn_id: ConnId, args: &[Vec<u8>], now_ms: u64, allow_block: bool) -> Execution {
    let req = match parse_xread(args) {
        Ok(r) => r,
        Err(e) => return Execution::Reply(Resp::from(e)),
    };
    if req.streams.iter().any(|name| server.strings.contains(name, now_ms)) {
        return Execution::Reply(Resp::from(CommandError::WrongType));
    }
    let watches = match resolve_watches(&server.streams, &req.streams, &req.since_tokens) {
        Ok(w) => w,
        Err(e) => return Execution::Reply(Resp::from(e)),
    };

    let reply = build_xread_reply(&server.streams, &watches);
    if reply != Resp::Array(vec![]) {
        return Execution::Reply(reply);
    }

    match req.block_ms {
        Some(ms) if allow_block => {
            let deadline_ms = if ms == 0 { None } else { Some(now_ms + ms) };
            server.blocking.register(BlockingWaiter { conn_id, deadline_ms, watches });
            if let Some(conn) = server.connections.get_mut(&conn_id) {
                conn.mode = ConnectionMode::Blocked;
            }
            Execution::Blocked
        }
        // No BLOCK, or blocking disallowed (inside MULTI): empty array,
        // never a null (spec §4.3).
        _ => Execution::Reply(Resp::Array(vec![])),
    }
}

/// Builds the XREAD reply shape (spec §4.3): a top-level array of
/// `[stream-name, [[id, [f1, v1, ...]], ...]]`, omitting streams with no
/// new entries. Shared between the immediate path and waking a blocked
/// reader after a matching append.
pub(crate) fn build_xread_reply(streams: &StreamStore, watches: &[(Vec<u8>, StreamEntryId)]) -> Resp {
    let mut results = Vec::new();
    for (name, since) in watches {
        if let Some(stream) = streams.get(name) {
            let entries = stream.after(*since);
            if !entries.is_empty() {
                let encoded: Vec<Resp> = entries.iter().map(|e| encode_stream_entry(e)).collect();
                results.push(Resp::Array(vec![Resp::bulk(name.clone()), Resp::Array(encoded)]));
            }
        }
    }
    Resp::Array(results)
}

fn encode_stream_entry(e: &StreamEntry) -> Resp {
    let mut fields = Vec::with_capacity(e.fields.len() * 2);
    for (k, v) in &e.fields {
        fields.push(Resp::bulk(k.clone()));
        fields.push(Resp::bulk(v.clone()));
    }
    Resp::Array(vec![Resp::bulk(e.id.to_string()), Resp::Array(fields)])
}
