// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-width wtmpx record codec and the textual form used by staging files and the wire.
//!
//! Every record in the stream is exactly [`RECORD_LENGTH`] bytes. Only five fields are
//! of interest to the pipeline:
//!
//! | field | offset | length | encoding                         |
//! |-------|--------|--------|----------------------------------|
//! | user  | 0      | 32     | ISO-8859-1, NUL/space padded     |
//! | pid   | 68     | 4      | big-endian `i32`                 |
//! | type  | 72     | 2      | big-endian `i16` (7 / 8)         |
//! | time  | 80     | 4      | big-endian `i32`, epoch seconds  |
//! | host  | 114    | 258    | ISO-8859-1, NUL/space padded     |

use std::fmt::{self, Write as _};
use std::str::FromStr;

use crate::errors::{DecodeError, LineError};

pub const RECORD_LENGTH: usize = 372;

const USER_OFFSET: usize = 0;
const USER_LENGTH: usize = 32;
const PID_OFFSET: usize = 68;
const TYPE_OFFSET: usize = 72;
const TIME_OFFSET: usize = 80;
const HOST_OFFSET: usize = 114;
const HOST_LENGTH: usize = 258;

const LINE_FIELDS: usize = 5;

pub const TYPE_LOGIN: i16 = 7;
pub const TYPE_LOGOUT: i16 = 8;

/// The `ut_type` of a record. Session pairing only cares about logins and logouts, but the
/// stream also carries boot, init and dead-process entries which are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Login,
    Logout,
    Other(i16),
}

impl EntryKind {
    pub fn code(self) -> i16 {
        match self {
            EntryKind::Login => TYPE_LOGIN,
            EntryKind::Logout => TYPE_LOGOUT,
            EntryKind::Other(code) => code,
        }
    }
}

impl From<i16> for EntryKind {
    fn from(code: i16) -> Self {
        match code {
            TYPE_LOGIN => EntryKind::Login,
            TYPE_LOGOUT => EntryKind::Logout,
            other => EntryKind::Other(other),
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub user: String,
    pub pid: i32,
    pub kind: EntryKind,
    pub time: i32,
    pub host: String,
}

/// Identifies one login/logout session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingKey {
    pub user: String,
    pub pid: i32,
    pub host: String,
}

impl LogEntry {
    pub fn new(
        user: impl Into<String>,
        pid: i32,
        kind: EntryKind,
        time: i32,
        host: impl Into<String>,
    ) -> Self {
        LogEntry {
            user: user.into(),
            pid,
            kind,
            time,
            host: host.into(),
        }
    }

    pub fn key(&self) -> PairingKey {
        PairingKey {
            user: self.user.clone(),
            pid: self.pid,
            host: self.host.clone(),
        }
    }

    /// Decodes one record from the front of `block`.
    ///
    /// Bytes past [`RECORD_LENGTH`] are ignored, so a caller may hand over a larger buffer.
    pub fn decode(block: &[u8]) -> Result<LogEntry, DecodeError> {
        if block.len() < RECORD_LENGTH {
            return Err(DecodeError::Insufficient {
                got: block.len(),
                needed: RECORD_LENGTH,
            });
        }

        let user = read_string(&block[USER_OFFSET..USER_OFFSET + USER_LENGTH]);
        let pid = i32::from_be_bytes(read_array(block, PID_OFFSET));
        let kind = EntryKind::from(i16::from_be_bytes(read_array(block, TYPE_OFFSET)));
        let time = i32::from_be_bytes(read_array(block, TIME_OFFSET));
        let host = read_string(&block[HOST_OFFSET..HOST_OFFSET + HOST_LENGTH]);

        Ok(LogEntry {
            user,
            pid,
            kind,
            time,
            host,
        })
    }

    /// Renders the entry into the fixed-width layout. Fields the pipeline doesn't read are
    /// zeroed, strings are NUL padded and truncated to their field width, and characters
    /// outside ISO-8859-1 are written as `?`.
    pub fn encode(&self) -> [u8; RECORD_LENGTH] {
        let mut block = [0u8; RECORD_LENGTH];
        write_string(&mut block[USER_OFFSET..USER_OFFSET + USER_LENGTH], &self.user);
        block[PID_OFFSET..PID_OFFSET + 4].copy_from_slice(&self.pid.to_be_bytes());
        block[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&self.kind.code().to_be_bytes());
        block[TIME_OFFSET..TIME_OFFSET + 4].copy_from_slice(&self.time.to_be_bytes());
        write_string(&mut block[HOST_OFFSET..HOST_OFFSET + HOST_LENGTH], &self.host);
        block
    }
}

fn read_array<const N: usize>(block: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&block[offset..offset + N]);
    out
}

// ISO-8859-1 maps each byte straight onto the first 256 code points.
fn read_string(field: &[u8]) -> String {
    let decoded: String = field.iter().map(|&b| char::from(b)).collect();
    decoded.trim_matches(|c: char| c <= ' ').to_string()
}

fn write_string(field: &mut [u8], value: &str) {
    for (slot, ch) in field.iter_mut().zip(value.chars()) {
        *slot = u8::try_from(u32::from(ch)).unwrap_or(b'?');
    }
}

/// `user,pid,type,time,host`
///
/// Backslash, comma, `\n` and `\r` inside `user` and `host` are escaped with a backslash, so an
/// entry always renders as one line that splits back into the same five fields.
impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            Escaped(&self.user),
            self.pid,
            self.kind.code(),
            self.time,
            Escaped(&self.host)
        )
    }
}

struct Escaped<'a>(&'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in self.0.chars() {
            match ch {
                '\\' => f.write_str("\\\\")?,
                ',' => f.write_str("\\,")?,
                '\n' => f.write_str("\\n")?,
                '\r' => f.write_str("\\r")?,
                other => f.write_char(other)?,
            }
        }
        Ok(())
    }
}

impl FromStr for LogEntry {
    type Err = LineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = split_fields(line);
        if fields.len() != LINE_FIELDS {
            return Err(LineError::FieldCount(fields.len()));
        }

        let pid = parse_field::<i32>("pid", &fields[1])?;
        let code = parse_field::<i16>("type", &fields[2])?;
        let time = parse_field::<i32>("time", &fields[3])?;
        let host = fields.pop().unwrap_or_default();
        let user = fields.swap_remove(0);

        Ok(LogEntry {
            user,
            pid,
            kind: EntryKind::from(code),
            time,
            host,
        })
    }
}

/// Splits on unescaped commas and resolves escapes. The host is last and takes the rest of the
/// line, so a bare comma inside it is kept.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::with_capacity(LINE_FIELDS);
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(escaped) => current.push(escaped),
                None => current.push('\\'),
            },
            ',' if fields.len() < LINE_FIELDS - 1 => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, LineError> {
    value.parse::<T>().map_err(|_| LineError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// A login and the logout that closed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRecord {
    pub login: LogEntry,
    pub logout: LogEntry,
}

impl MatchedRecord {
    /// Pairs two entries, returning `None` unless they are a login and a logout sharing a
    /// [`PairingKey`].
    pub fn new(login: LogEntry, logout: LogEntry) -> Option<Self> {
        let kinds_ok = login.kind == EntryKind::Login && logout.kind == EntryKind::Logout;
        if kinds_ok && login.key() == logout.key() {
            Some(MatchedRecord { login, logout })
        } else {
            None
        }
    }

    /// The lines this record contributes to a staging file or a transmission.
    pub fn lines(&self) -> [String; 2] {
        [self.login.to_string(), self.logout.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn login(user: &str, pid: i32, time: i32, host: &str) -> LogEntry {
        LogEntry::new(user, pid, EntryKind::Login, time, host)
    }

    #[test]
    fn test_decode_reads_fixed_offsets() {
        let mut block = [0u8; RECORD_LENGTH];
        block[..5].copy_from_slice(b"alice");
        block[68..72].copy_from_slice(&4242i32.to_be_bytes());
        block[72..74].copy_from_slice(&8i16.to_be_bytes());
        block[80..84].copy_from_slice(&1_656_581_409i32.to_be_bytes());
        block[114..122].copy_from_slice(b"10.1.2.3");

        let entry = LogEntry::decode(&block).expect("decode failed");
        assert_eq!(entry.user, "alice");
        assert_eq!(entry.pid, 4242);
        assert_eq!(entry.kind, EntryKind::Logout);
        assert_eq!(entry.time, 1_656_581_409);
        assert_eq!(entry.host, "10.1.2.3");
    }

    #[test]
    fn test_decode_trims_padding() {
        let mut block = [0u8; RECORD_LENGTH];
        block[..8].copy_from_slice(b"  bob   ");
        block[114..120].copy_from_slice(b" host ");
        let entry = LogEntry::decode(&block).expect("decode failed");
        assert_eq!(entry.user, "bob");
        assert_eq!(entry.host, "host");
    }

    #[test]
    fn test_decode_latin1_bytes() {
        let mut block = [0u8; RECORD_LENGTH];
        block[..4].copy_from_slice(&[b'j', 0xF6, b'r', b'g']);
        let entry = LogEntry::decode(&block).expect("decode failed");
        assert_eq!(entry.user, "j\u{f6}rg");
    }

    #[test]
    fn test_decode_insufficient_data() {
        let block = [0u8; RECORD_LENGTH - 1];
        assert_eq!(
            LogEntry::decode(&block),
            Err(DecodeError::Insufficient {
                got: RECORD_LENGTH - 1,
                needed: RECORD_LENGTH
            })
        );
    }

    #[test]
    fn test_decode_keeps_non_session_types() {
        let entry = LogEntry::new("reboot", 0, EntryKind::Other(2), 10, "");
        let decoded = LogEntry::decode(&entry.encode()).expect("decode failed");
        assert_eq!(decoded.kind, EntryKind::Other(2));
        assert_eq!(decoded.to_string(), "reboot,0,2,10,");
    }

    #[test]
    fn test_encode_truncates_long_fields() {
        let user = "u".repeat(40);
        let entry = login(&user, 1, 1, "h");
        let decoded = LogEntry::decode(&entry.encode()).expect("decode failed");
        assert_eq!(decoded.user, "u".repeat(32));
    }

    #[test]
    fn test_display_and_parse_line() {
        let entry = login("bob", 100, 1_000, "10.0.0.1");
        assert_eq!(entry.to_string(), "bob,100,7,1000,10.0.0.1");
        assert_eq!("bob,100,7,1000,10.0.0.1".parse::<LogEntry>(), Ok(entry));
    }

    #[test]
    fn test_parse_line_keeps_commas_in_host() {
        let entry: LogEntry = "bob,1,8,2,host,with,commas".parse().expect("parse failed");
        assert_eq!(entry.host, "host,with,commas");
        assert_eq!(entry.kind, EntryKind::Logout);
    }

    #[test]
    fn test_line_escapes_separators_in_strings() {
        let entry = login("a,b", 1, 5, "h\nx\\y\r");
        let line = entry.to_string();
        assert_eq!(line, "a\\,b,1,7,5,h\\nx\\\\y\\r");
        assert!(!line.contains('\n'));
        assert_eq!(line.parse::<LogEntry>(), Ok(entry));
    }

    #[test]
    fn test_parse_line_errors() {
        assert_eq!(
            "bob,1,7".parse::<LogEntry>(),
            Err(LineError::FieldCount(3))
        );
        assert_eq!(
            "bob,x,7,1,h".parse::<LogEntry>(),
            Err(LineError::InvalidField {
                field: "pid",
                value: "x".to_string()
            })
        );
        assert_eq!(
            "bob,1,99999,1,h".parse::<LogEntry>(),
            Err(LineError::InvalidField {
                field: "type",
                value: "99999".to_string()
            })
        );
    }

    #[test]
    fn test_matched_record_requires_same_key_and_kinds() {
        let logout = LogEntry::new("bob", 100, EntryKind::Logout, 1_060, "10.0.0.1");
        let matched = MatchedRecord::new(login("bob", 100, 1_000, "10.0.0.1"), logout.clone())
            .expect("should pair");
        assert_eq!(
            matched.lines(),
            [
                "bob,100,7,1000,10.0.0.1".to_string(),
                "bob,100,8,1060,10.0.0.1".to_string()
            ]
        );

        assert!(MatchedRecord::new(login("bob", 101, 1_000, "10.0.0.1"), logout.clone()).is_none());
        assert!(MatchedRecord::new(logout.clone(), logout).is_none());
    }

    proptest! {
        #[test]
        fn prop_encode_decode_preserves_fields(
            user in "[a-z][a-z0-9_]{0,31}",
            pid in any::<i32>(),
            code in any::<i16>(),
            time in any::<i32>(),
            host in "[a-z0-9.:-]{0,64}",
        ) {
            let entry = LogEntry::new(user, pid, EntryKind::from(code), time, host);
            let decoded = LogEntry::decode(&entry.encode()).expect("decode failed");
            prop_assert_eq!(decoded, entry);
        }
    }
}
