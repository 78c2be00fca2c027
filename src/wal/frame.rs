//! The WAL payload grammar and checksum (spec section 4.8).
//!
//! Each logical op becomes one `LogOp`, encoded as a space-separated textual
//! payload starting with an opcode. Key/value fields are arbitrary bytes, so
//! - unlike the opcode/id tokens, which are plain ASCII - they're hex-encoded
//! within the payload to keep the space-separated grammar unambiguous.

use crate::error::{CResult, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    CreateTable { name: String, partition: String, expected_id: u64 },
    DropTable { table_id: u64 },
    StartTransaction { tx_id: u64 },
    CommitTransaction { tx_id: u64 },
    RollbackTransaction { tx_id: u64 },
    Set { tx_id: u64, table_id: u64, key: Vec<u8>, value: Vec<u8> },
    Del { tx_id: u64, table_id: u64, key: Vec<u8> },
    /// Read-only ops. Logged (if ever emitted) purely for an audit trail;
    /// replay always treats them as no-ops (spec section 4.8).
    Get,
    Scan,
    Process,
    RangeProcess,
    BatchExecute,
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn hex_decode(s: &str) -> CResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Internal(format!("odd-length hex token: {s}")));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let hi = (bytes[i] as char).to_digit(16);
        let lo = (bytes[i + 1] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push(((hi << 4) | lo) as u8),
            _ => return Err(Error::Internal(format!("invalid hex token: {s}"))),
        }
        i += 2;
    }
    Ok(out)
}

pub fn encode_payload(op: &LogOp) -> Vec<u8> {
    let text = match op {
        LogOp::CreateTable { name, partition, expected_id } => {
            format!("CREATE_TABLE {} {} {}", hex_encode(name.as_bytes()), partition, expected_id)
        }
        LogOp::DropTable { table_id } => format!("DROP_TABLE {table_id}"),
        LogOp::StartTransaction { tx_id } => format!("START_TRANSACTION {tx_id}"),
        LogOp::CommitTransaction { tx_id } => format!("COMMIT_TRANSACTION {tx_id}"),
        LogOp::RollbackTransaction { tx_id } => format!("ROLLBACK_TRANSACTION {tx_id}"),
        LogOp::Set { tx_id, table_id, key, value } => {
            format!("SET {tx_id} {table_id} {} {}", hex_encode(key), hex_encode(value))
        }
        LogOp::Del { tx_id, table_id, key } => {
            format!("DEL {tx_id} {table_id} {}", hex_encode(key))
        }
        LogOp::Get => "GET".to_string(),
        LogOp::Scan => "SCAN".to_string(),
        LogOp::Process => "PROCESS".to_string(),
        LogOp::RangeProcess => "RANGE_PROCESS".to_string(),
        LogOp::BatchExecute => "BATCH_EXECUTE".to_string(),
    };
    text.into_bytes()
}

pub fn decode_payload(payload: &[u8]) -> CResult<LogOp> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Internal(format!("payload is not utf-8: {e}")))?;
    let tokens: Vec<&str> = text.split(' ').collect();
    let bad = || Error::Internal(format!("malformed WAL payload: {text}"));
    let parse_u64 = |s: &str| s.parse::<u64>().map_err(|_| bad());

    match tokens.as_slice() {
        ["CREATE_TABLE", name, partition, expected_id] => Ok(LogOp::CreateTable {
            name: String::from_utf8(hex_decode(name)?).map_err(|_| bad())?,
            partition: partition.to_string(),
            expected_id: parse_u64(expected_id)?,
        }),
        ["DROP_TABLE", table_id] => Ok(LogOp::DropTable { table_id: parse_u64(table_id)? }),
        ["START_TRANSACTION", tx_id] => {
            Ok(LogOp::StartTransaction { tx_id: parse_u64(tx_id)? })
        }
        ["COMMIT_TRANSACTION", tx_id] => {
            Ok(LogOp::CommitTransaction { tx_id: parse_u64(tx_id)? })
        }
        ["ROLLBACK_TRANSACTION", tx_id] => {
            Ok(LogOp::RollbackTransaction { tx_id: parse_u64(tx_id)? })
        }
        ["SET", tx_id, table_id, key, value] => Ok(LogOp::Set {
            tx_id: parse_u64(tx_id)?,
            table_id: parse_u64(table_id)?,
            key: hex_decode(key)?,
            value: hex_decode(value)?,
        }),
        ["DEL", tx_id, table_id, key] => Ok(LogOp::Del {
            tx_id: parse_u64(tx_id)?,
            table_id: parse_u64(table_id)?,
            key: hex_decode(key)?,
        }),
        ["GET"] => Ok(LogOp::Get),
        ["SCAN"] => Ok(LogOp::Scan),
        ["PROCESS"] => Ok(LogOp::Process),
        ["RANGE_PROCESS"] => Ok(LogOp::RangeProcess),
        ["BATCH_EXECUTE"] => Ok(LogOp::BatchExecute),
        _ => Err(bad()),
    }
}

/// `c = 0; for each byte b: c = c*31 + b` (unsigned 32-bit rollover), over the
/// payload only (spec section 4.8).
pub fn checksum(payload: &[u8]) -> u32 {
    let mut c: u32 = 0;
    for &b in payload {
        c = c.wrapping_mul(31).wrapping_add(b as u32);
    }
    c
}

/// Escapes non-printable bytes as `\XX` hex, keeping printable ASCII as-is -
/// the text-framing codec (spec section 4.8), independent of the per-field
/// hex encoding `encode_payload` uses for key/value tokens.
pub fn text_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b != b'\\' && (b.is_ascii_graphic() || b == b' ') {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:02x}"));
        }
    }
    out
}

pub fn text_unescape(s: &str) -> CResult<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).map_err(|_| {
                Error::Internal("invalid hex escape in text log payload".into())
            })?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::Internal("invalid hex escape in text log payload".into()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_for_every_opcode() {
        let ops = vec![
            LogOp::CreateTable { name: "t".into(), partition: "hash".into(), expected_id: 1 },
            LogOp::DropTable { table_id: 1 },
            LogOp::StartTransaction { tx_id: 5 },
            LogOp::CommitTransaction { tx_id: 5 },
            LogOp::RollbackTransaction { tx_id: 5 },
            LogOp::Set { tx_id: 5, table_id: 1, key: b"k".to_vec(), value: b"v\0v".to_vec() },
            LogOp::Del { tx_id: 5, table_id: 1, key: vec![0xff, 0x00] },
            LogOp::Get,
            LogOp::Scan,
            LogOp::Process,
            LogOp::RangeProcess,
            LogOp::BatchExecute,
        ];
        for op in ops {
            let payload = encode_payload(&op);
            let decoded = decode_payload(&payload).unwrap();
            assert_eq!(decoded, op);
        }
    }

    #[test]
    fn checksum_is_deterministic_and_sensitive_to_content() {
        let a = checksum(b"hello");
        let b = checksum(b"hello");
        let c = checksum(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn text_escape_round_trips_arbitrary_bytes() {
        for sample in [&b""[..], b"plain ascii", &[0u8, 1, 2, 0xff, b'\\', b'a']] {
            let escaped = text_escape(sample);
            let restored = text_unescape(&escaped).unwrap();
            assert_eq!(restored, sample);
        }
    }

    #[test]
    fn text_escape_disambiguates_literal_backslash_from_hex_escape() {
        // A literal backslash immediately followed by bytes that look like a
        // hex escape (`ab`) must not be misparsed as `\ab` on decode.
        let sample: &[u8] = &[b'\\', b'a', b'b'];
        let escaped = text_escape(sample);
        let restored = text_unescape(&escaped).unwrap();
        assert_eq!(restored, sample);
    }
}
