//! One-shot loader for the on-disk snapshot image into the string store and
//! its expiration table. See spec §4.7.
//!
//! This parses a deliberately simplified subset of the real RDB binary
//! layout (1-byte length prefixes throughout, rather than RDB's variable
//! length encoding) — the subset this system actually writes and needs to
//! read back, not a general-purpose RDB parser.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};

use crate::store::StringStore;

const OP_AUX: u8 = 0xFA;
const OP_SELECTDB: u8 = 0xFE;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRE_SECONDS: u8 = 0xFD;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EOF: u8 = 0xFF;
const TYPE_STRING: u8 = 0x00;

pub struct LoadStats {
    pub loaded: usize,
    pub dropped_expired: usize,
}

/// Loads `dir/dbfilename` into `store`, if the file exists. `now_wall_ms`
/// and `now_mono_ms` are a matched pair of clock readings taken once at
/// startup, used to convert the snapshot's wall-clock expirations into the
/// server's monotonic deadlines.
pub fn load_into(
    store: &mut StringStore,
    path: &Path,
    now_wall_ms: u64,
    now_mono_ms: u64,
) -> Result<Option<LoadStats>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).with_context(|| format!("opening snapshot {}", path.display()))?;
    let entries = parse(BufReader::new(file))?;

    let mut loaded = 0;
    let mut dropped_expired = 0;
    for entry in entries {
        match entry.expire_at_epoch_ms {
            Some(expire_ms) if expire_ms <= now_wall_ms => {
                dropped_expired += 1;
            }
            Some(expire_ms) => {
                let deadline_ms = now_mono_ms + (expire_ms - now_wall_ms);
                store.load(entry.key, entry.value, Some(deadline_ms));
                loaded += 1;
            }
            None => {
                store.load(entry.key, entry.value, None);
                loaded += 1;
            }
        }
    }
    Ok(Some(LoadStats { loaded, dropped_expired }))
}

struct LoadedEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    expire_at_epoch_ms: Option<u64>,
}

fn parse(mut reader: impl Read) -> Result<Vec<LoadedEntry>> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header).context("reading snapshot header")?;
    if &header[0..5] != b"REDIS" {
        bail!("snapshot header is not a REDIS image: {:?}", &header[0..5]);
    }

    let mut entries = Vec::new();
    let mut pending_expire_ms: Option<u64> = None;

    loop {
        let op = match read_u8(&mut reader) {
            Ok(b) => b,
            Err(_) => break, // truncated file with no EOF marker: stop with what we have
        };
        match op {
            OP_AUX => {
                let _name = read_len_prefixed(&mut reader)?;
                let _value = read_len_prefixed(&mut reader)?;
            }
            OP_SELECTDB => {
                let _db_number = read_u8(&mut reader)?;
            }
            OP_RESIZEDB => {
                let _hash_size = read_u8(&mut reader)?;
                let _expire_size = read_u8(&mut reader)?;
            }
            OP_EXPIRE_SECONDS => {
                let secs = read_u32_le(&mut reader)?;
                pending_expire_ms = Some(secs as u64 * 1000);
            }
            OP_EXPIRE_MS => {
                pending_expire_ms = Some(read_u64_le(&mut reader)?);
            }
            OP_EOF => break,
            TYPE_STRING => {
                let key = read_len_prefixed(&mut reader)?;
                let value = read_len_prefixed(&mut reader)?;
                entries.push(LoadedEntry { key, value, expire_at_epoch_ms: pending_expire_ms.take() });
            }
            other => {
                // Any value type beyond the supported string type ends
                // parsing (spec §4.7); what was already loaded is kept.
                let _ = other;
                break;
            }
        }
    }

    Ok(entries)
}

fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32_le(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_le(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_len_prefixed(reader: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u8(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Current wall-clock time as Unix epoch milliseconds.
pub fn wall_clock_now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_string_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = vec![TYPE_STRING, key.len() as u8];
        out.extend_from_slice(key);
        out.push(value.len() as u8);
        out.extend_from_slice(value);
        out
    }

    fn wrap(body: Vec<u8>) -> Vec<u8> {
        let mut out = b"REDIS0011".to_vec();
        out.extend(body);
        out.push(OP_EOF);
        out.extend_from_slice(&[0u8; 8]); // crc64 placeholder, unused by the loader
        out
    }

    #[test]
    fn missing_file_starts_empty() {
        let mut store = StringStore::new();
        let stats = load_into(&mut store, std::path::Path::new("/nonexistent/x"), 0, 0).unwrap();
        assert!(stats.is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn loads_simple_key_value() {
        let bytes = wrap(encode_string_entry(b"x", b"100"));
        let entries = parse(&bytes[..]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"x");
        assert_eq!(entries[0].value, b"100");
        assert!(entries[0].expire_at_epoch_ms.is_none());
    }

    #[test]
    fn skips_aux_fields_and_selectors() {
        let mut body = vec![OP_AUX, 4, b'n', b'a', b'm', b'e', 3, b'v', b'a', b'l'];
        body.push(OP_SELECTDB);
        body.push(0);
        body.push(OP_RESIZEDB);
        body.push(2);
        body.push(0);
        body.extend(encode_string_entry(b"k", b"v"));
        let bytes = wrap(body);
        let entries = parse(&bytes[..]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"k");
    }

    #[test]
    fn future_expiration_is_kept_and_converted() {
        let mut body = vec![OP_EXPIRE_MS];
        body.extend_from_slice(&9_999_999_999_000u64.to_le_bytes());
        body.extend(encode_string_entry(b"k", b"v"));
        let bytes = wrap(body);
        let entries = parse(&bytes[..]).unwrap();
        assert_eq!(entries[0].expire_at_epoch_ms, Some(9_999_999_999_000));

        let mut store = StringStore::new();
        // pretend wall-now is far earlier than the expiration
        for e in entries {
            store.load(e.key, e.value, e.expire_at_epoch_ms.map(|ms| ms - 1_000_000 + 5_000));
        }
        assert_eq!(store.get(b"k", 0), Some(&b"v"[..]));
    }

    #[test]
    fn already_expired_entry_is_dropped_at_load() {
        let mut body = vec![OP_EXPIRE_SECONDS];
        body.extend_from_slice(&1u32.to_le_bytes()); // 1970-01-01T00:00:01Z, long past
        body.extend(encode_string_entry(b"k", b"v"));
        let bytes = wrap(body);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        std::fs::write(&path, &bytes).unwrap();

        let mut store = StringStore::new();
        let stats = load_into(&mut store, &path, wall_clock_now_ms(), 0).unwrap().unwrap();
        assert_eq!(stats.loaded, 0);
        assert_eq!(stats.dropped_expired, 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn unsupported_type_byte_ends_parsing_but_keeps_prior_entries() {
        let mut body = encode_string_entry(b"k", b"v");
        body.push(0x04); // hash type, unsupported
        body.push(1);
        body.push(b'x');
        let bytes = wrap(body);
        let entries = parse(&bytes[..]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"k");
    }
}
