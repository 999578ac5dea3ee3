//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Oryx.
//
// Oryx is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Oryx is distributed  in the hope  that it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Oryx. If not, see <http://www.gnu.org/licenses/>.

//! The PostgreSQL frontend/backend protocol, version 3.0.
//!
//! Every message is `<1 byte type><4 byte big-endian length including
//! itself><payload>`, except StartupMessage, which has no type byte. We
//! only request the text result format; that is sufficient for everything
//! the store does.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::support::buffer::NetBuffer;
use crate::support::error::Error;

pub const PROTOCOL_VERSION: i32 = 196_608; // 3 << 16

/// One column of a RowDescription.
#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub type_oid: i32,
}

/// Error and Notice messages share this shape.
#[derive(Clone, Debug, Default)]
pub struct Diagnostic {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    fn parse(payload: &[u8]) -> Self {
        let mut diag = Diagnostic::default();
        let mut rest = payload;
        while let Some((&field, tail)) = rest.split_first() {
            if 0 == field {
                break;
            }
            let end =
                tail.iter().position(|&b| 0 == b).unwrap_or(tail.len());
            let value =
                String::from_utf8_lossy(&tail[..end]).into_owned();
            match field {
                b'S' => diag.severity = value,
                b'C' => diag.code = value,
                b'M' => diag.message = value,
                _ => (),
            }
            rest = &tail[(end + 1).min(tail.len())..];
        }
        diag
    }
}

#[derive(Clone, Debug)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    CryptPassword { salt: [u8; 2] },
    Md5Password { salt: [u8; 4] },
    Unsupported(i32),
}

/// A message from the backend, dispatched by its tag byte.
#[derive(Clone, Debug)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, key: i32 },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription,
    PortalSuspended,
    RowDescription(Vec<Column>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(Diagnostic),
    NoticeResponse(Diagnostic),
    ReadyForQuery(u8),
    CopyInResponse,
    NotificationResponse { pid: i32, channel: String, payload: String },
    Unknown(u8),
}

/// Removes and parses one backend message from `buf`, or returns
/// `Ok(None)` if a whole message is not buffered yet.
pub fn next_message(
    buf: &mut NetBuffer,
) -> Result<Option<BackendMessage>, Error> {
    let header = match buf.string(5) {
        Some(h) => h,
        None => return Ok(None),
    };
    let tag = header[0];
    let length = BigEndian::read_i32(&header[1..5]);
    if length < 4 {
        return Err(Error::ProtocolViolation(format!(
            "nonsense length {} in message '{}'",
            length, tag as char,
        )));
    }
    let total = 1 + length as usize;
    let payload = match buf.string(total) {
        Some(whole) => whole[5..].to_vec(),
        None => return Ok(None),
    };
    buf.consume(total);

    let msg = match tag {
        b'R' => BackendMessage::Authentication(parse_auth(&payload)?),
        b'S' => {
            let (name, rest) = take_cstr(&payload)?;
            let (value, _) = take_cstr(rest)?;
            BackendMessage::ParameterStatus { name, value }
        },
        b'K' => {
            require_len(&payload, 8, tag)?;
            BackendMessage::BackendKeyData {
                pid: BigEndian::read_i32(&payload[0..4]),
                key: BigEndian::read_i32(&payload[4..8]),
            }
        },
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b't' => BackendMessage::ParameterDescription,
        b's' => BackendMessage::PortalSuspended,
        b'T' => BackendMessage::RowDescription(parse_row_description(
            &payload,
        )?),
        b'D' => BackendMessage::DataRow(parse_data_row(&payload)?),
        b'C' => {
            let (text, _) = take_cstr(&payload)?;
            BackendMessage::CommandComplete(text)
        },
        b'I' => BackendMessage::EmptyQueryResponse,
        b'E' => BackendMessage::ErrorResponse(Diagnostic::parse(&payload)),
        b'N' => BackendMessage::NoticeResponse(Diagnostic::parse(&payload)),
        b'Z' => {
            require_len(&payload, 1, tag)?;
            BackendMessage::ReadyForQuery(payload[0])
        },
        b'G' => BackendMessage::CopyInResponse,
        b'A' => {
            require_len(&payload, 5, tag)?;
            let pid = BigEndian::read_i32(&payload[0..4]);
            let (channel, rest) = take_cstr(&payload[4..])?;
            let (notify_payload, _) = take_cstr(rest)?;
            BackendMessage::NotificationResponse {
                pid,
                channel,
                payload: notify_payload,
            }
        },
        other => BackendMessage::Unknown(other),
    };
    Ok(Some(msg))
}

fn parse_auth(payload: &[u8]) -> Result<AuthRequest, Error> {
    require_len(payload, 4, b'R')?;
    let subtype = BigEndian::read_i32(&payload[0..4]);
    Ok(match subtype {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        4 => {
            require_len(payload, 6, b'R')?;
            AuthRequest::CryptPassword {
                salt: [payload[4], payload[5]],
            }
        },
        5 => {
            require_len(payload, 8, b'R')?;
            AuthRequest::Md5Password {
                salt: [payload[4], payload[5], payload[6], payload[7]],
            }
        },
        other => AuthRequest::Unsupported(other),
    })
}

fn parse_row_description(payload: &[u8]) -> Result<Vec<Column>, Error> {
    require_len(payload, 2, b'T')?;
    let count = BigEndian::read_i16(&payload[0..2]);
    let mut rest = &payload[2..];
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (name, tail) = take_cstr(rest)?;
        require_len(tail, 18, b'T')?;
        let type_oid = BigEndian::read_i32(&tail[6..10]);
        columns.push(Column { name, type_oid });
        rest = &tail[18..];
    }
    Ok(columns)
}

fn parse_data_row(
    payload: &[u8],
) -> Result<Vec<Option<Vec<u8>>>, Error> {
    require_len(payload, 2, b'D')?;
    let count = BigEndian::read_i16(&payload[0..2]);
    let mut rest = &payload[2..];
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        require_len(rest, 4, b'D')?;
        let len = BigEndian::read_i32(&rest[0..4]);
        rest = &rest[4..];
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            require_len(rest, len, b'D')?;
            values.push(Some(rest[..len].to_vec()));
            rest = &rest[len..];
        }
    }
    Ok(values)
}

fn take_cstr(bytes: &[u8]) -> Result<(String, &[u8]), Error> {
    let end = bytes.iter().position(|&b| 0 == b).ok_or_else(|| {
        Error::ProtocolViolation("unterminated string".to_owned())
    })?;
    Ok((
        String::from_utf8_lossy(&bytes[..end]).into_owned(),
        &bytes[end + 1..],
    ))
}

fn require_len(bytes: &[u8], n: usize, tag: u8) -> Result<(), Error> {
    if bytes.len() < n {
        Err(Error::ProtocolViolation(format!(
            "truncated '{}' message",
            tag as char,
        )))
    } else {
        Ok(())
    }
}

/// Builder for frontend messages.
struct MessageOut {
    tag: u8,
    payload: Vec<u8>,
}

impl MessageOut {
    fn new(tag: u8) -> Self {
        MessageOut {
            tag,
            payload: Vec::new(),
        }
    }

    fn cstr(mut self, s: &str) -> Self {
        self.payload.extend_from_slice(s.as_bytes());
        self.payload.push(0);
        self
    }

    fn i16(mut self, v: i16) -> Self {
        let _ = self.payload.write_i16::<BigEndian>(v);
        self
    }

    fn i32(mut self, v: i32) -> Self {
        let _ = self.payload.write_i32::<BigEndian>(v);
        self
    }

    fn bytes(mut self, v: &[u8]) -> Self {
        self.payload.extend_from_slice(v);
        self
    }

    fn finish(self, dst: &mut Vec<u8>) {
        dst.push(self.tag);
        let _ = dst
            .write_i32::<BigEndian>(self.payload.len() as i32 + 4);
        dst.extend_from_slice(&self.payload);
    }
}

pub fn startup(user: &str, database: &str, dst: &mut Vec<u8>) {
    let mut payload = Vec::new();
    let _ = payload.write_i32::<BigEndian>(PROTOCOL_VERSION);
    for (k, v) in &[("user", user), ("database", database)] {
        payload.extend_from_slice(k.as_bytes());
        payload.push(0);
        payload.extend_from_slice(v.as_bytes());
        payload.push(0);
    }
    payload.push(0);

    let _ = dst.write_i32::<BigEndian>(payload.len() as i32 + 4);
    dst.extend_from_slice(&payload);
}

pub fn password(secret: &str, dst: &mut Vec<u8>) {
    MessageOut::new(b'p').cstr(secret).finish(dst);
}

pub fn parse(name: &str, sql: &str, dst: &mut Vec<u8>) {
    MessageOut::new(b'P')
        .cstr(name)
        .cstr(sql)
        .i16(0) // no pre-specified parameter types
        .finish(dst);
}

pub fn bind(
    statement: &str,
    params: &[Option<Vec<u8>>],
    dst: &mut Vec<u8>,
) {
    let mut msg = MessageOut::new(b'B')
        .cstr("") // unnamed portal
        .cstr(statement)
        .i16(0) // all parameters in text format
        .i16(i16::try_from(params.len()).unwrap_or(i16::MAX));
    for param in params {
        match param {
            None => msg = msg.i32(-1),
            Some(value) => {
                msg = msg.i32(value.len() as i32).bytes(value);
            },
        }
    }
    msg.i16(0) // all results in text format
        .finish(dst);
}

pub fn describe_portal(dst: &mut Vec<u8>) {
    MessageOut::new(b'D').bytes(b"P").cstr("").finish(dst);
}

pub fn execute(dst: &mut Vec<u8>) {
    MessageOut::new(b'E')
        .cstr("") // unnamed portal
        .i32(0) // no row limit
        .finish(dst);
}

pub fn sync(dst: &mut Vec<u8>) {
    MessageOut::new(b'S').finish(dst);
}

pub fn terminate(dst: &mut Vec<u8>) {
    MessageOut::new(b'X').finish(dst);
}

pub fn copy_data(line: &[u8], dst: &mut Vec<u8>) {
    MessageOut::new(b'd').bytes(line).finish(dst);
}

pub fn copy_done(dst: &mut Vec<u8>) {
    MessageOut::new(b'c').finish(dst);
}

pub fn copy_fail(reason: &str, dst: &mut Vec<u8>) {
    MessageOut::new(b'f').cstr(reason).finish(dst);
}

/// The response to an MD5 authentication challenge:
/// `md5(md5(password + user) + salt)` in hex, prefixed with `md5`.
pub fn md5_auth_response(
    user: &str,
    secret: &str,
    salt: &[u8; 4],
) -> String {
    let inner = md5_hex(&[secret.as_bytes(), user.as_bytes()].concat());
    let outer = md5_hex(&[inner.as_bytes(), &salt[..]].concat());
    format!("md5{}", outer)
}

fn md5_hex(data: &[u8]) -> String {
    let digest =
        openssl::hash::hash(openssl::hash::MessageDigest::md5(), data)
            .expect("MD5 unavailable");
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(bytes: &[u8]) -> NetBuffer {
        let mut buf = NetBuffer::new();
        buf.append(bytes);
        buf
    }

    #[test]
    fn startup_has_no_tag() {
        let mut out = Vec::new();
        startup("aox", "mail", &mut out);
        // length + version + "user\0aox\0database\0mail\0" + terminator
        assert_eq!(
            (out.len() as i32),
            BigEndian::read_i32(&out[0..4]),
        );
        assert_eq!(PROTOCOL_VERSION, BigEndian::read_i32(&out[4..8]));
        assert!(out.windows(5).any(|w| w == b"user\0"));
    }

    #[test]
    fn incomplete_message_returns_none() {
        let mut buf = feed(&[b'Z', 0, 0, 0, 5]);
        assert_matches!(Ok(None), next_message(&mut buf));
        buf.append(&[b'I']);
        assert_matches!(
            Ok(Some(BackendMessage::ReadyForQuery(b'I'))),
            next_message(&mut buf)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_auth_md5() {
        let mut buf = feed(&[
            b'R', 0, 0, 0, 12, 0, 0, 0, 5, 1, 2, 3, 4,
        ]);
        match next_message(&mut buf).unwrap().unwrap() {
            BackendMessage::Authentication(AuthRequest::Md5Password {
                salt,
            }) => assert_eq!([1, 2, 3, 4], salt),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_data_row_with_null() {
        // 2 columns: "42", NULL
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0, 2]);
        payload.extend_from_slice(&[0, 0, 0, 2]);
        payload.extend_from_slice(b"42");
        payload.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let mut framed = vec![b'D'];
        framed.extend_from_slice(
            &((payload.len() as i32 + 4).to_be_bytes()),
        );
        framed.extend_from_slice(&payload);

        let mut buf = feed(&framed);
        match next_message(&mut buf).unwrap().unwrap() {
            BackendMessage::DataRow(values) => {
                assert_eq!(2, values.len());
                assert_eq!(Some(b"42".to_vec()), values[0]);
                assert_eq!(None, values[1]);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_error_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SFATAL\0C28000\0Mno thanks\0\0");
        let mut framed = vec![b'E'];
        framed.extend_from_slice(
            &((payload.len() as i32 + 4).to_be_bytes()),
        );
        framed.extend_from_slice(&payload);

        let mut buf = feed(&framed);
        match next_message(&mut buf).unwrap().unwrap() {
            BackendMessage::ErrorResponse(diag) => {
                assert_eq!("FATAL", diag.severity);
                assert_eq!("28000", diag.code);
                assert_eq!("no thanks", diag.message);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn md5_response_shape() {
        let response = md5_auth_response("user", "pw", &[0, 1, 2, 3]);
        assert!(response.starts_with("md5"));
        assert_eq!(35, response.len());
        assert!(response[3..].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn bind_encodes_null_as_negative_length() {
        let mut out = Vec::new();
        bind("stmt", &[Some(b"x".to_vec()), None], &mut out);
        assert_eq!(b'B', out[0]);
        // NULL is length -1 with no payload bytes
        assert!(out
            .windows(4)
            .any(|w| w == (-1i32).to_be_bytes()));
    }
}
