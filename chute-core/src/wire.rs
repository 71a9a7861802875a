//! Framing: one ASCII header line (`TAG|field|...\n`), then the raw payload for FRAGMENT.

use std::str::FromStr;

use crate::protocol::{
    ErrorReason, Kind, Reply, Request, FIELD_DELIMITER, HEADER_TERMINATOR, MAX_DATAGRAM,
};

/// Encode a request into a single datagram.
pub fn encode_request(req: &Request) -> Result<Vec<u8>, FrameEncodeError> {
    let mut header = HeaderWriter::new(req.kind().tag());
    let payload: &[u8] = match req {
        Request::Start {
            filename,
            fragment_count,
            total_size,
            uploader,
        } => {
            header.field("filename", filename)?;
            header.field("fragment_count", &fragment_count.to_string())?;
            header.field("total_size", &total_size.to_string())?;
            header.field("uploader", uploader)?;
            &[]
        }
        Request::Fragment {
            sequence,
            filename,
            uploader,
            payload,
        } => {
            header.field("sequence", &sequence.to_string())?;
            header.field("filename", filename)?;
            header.field("uploader", uploader)?;
            payload.as_slice()
        }
        Request::End { filename, uploader } => {
            header.field("filename", filename)?;
            header.field("uploader", uploader)?;
            &[]
        }
        Request::Login { username, password } | Request::Register { username, password } => {
            header.field("username", username)?;
            header.field("password", password)?;
            &[]
        }
    };
    header.finish(payload)
}

/// Decode one datagram into a request. Field counts are checked before any field is read.
pub fn decode_request(bytes: &[u8]) -> Result<Request, FrameDecodeError> {
    let (line, tail) = split_header(bytes)?;
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    let kind =
        Kind::from_tag(fields[0]).ok_or_else(|| FrameDecodeError::UnknownKind(fields[0].into()))?;
    if fields.len() != kind.field_count() {
        return Err(FrameDecodeError::FieldCount {
            kind: kind.tag(),
            expected: kind.field_count(),
            found: fields.len(),
        });
    }
    let req = match kind {
        Kind::Start => Request::Start {
            filename: fields[1].to_string(),
            fragment_count: parse_int("fragment_count", fields[2])?,
            total_size: parse_int("total_size", fields[3])?,
            uploader: fields[4].to_string(),
        },
        Kind::Fragment => Request::Fragment {
            sequence: parse_int("sequence", fields[1])?,
            filename: fields[2].to_string(),
            uploader: fields[3].to_string(),
            payload: tail.to_vec(),
        },
        Kind::End => Request::End {
            filename: fields[1].to_string(),
            uploader: fields[2].to_string(),
        },
        Kind::Login => Request::Login {
            username: fields[1].to_string(),
            password: fields[2].to_string(),
        },
        Kind::Register => Request::Register {
            username: fields[1].to_string(),
            password: fields[2].to_string(),
        },
    };
    Ok(req)
}

/// Encode a reply as one header line.
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, FrameEncodeError> {
    match reply {
        Reply::StartAck { filename } | Reply::EndAck { filename } => {
            check_field("filename", filename)?
        }
        Reply::FragmentAck { filename, .. } => check_field("filename", filename)?,
        Reply::Error { reason, detail } => {
            check_field("reason", reason.as_str())?;
            for d in detail {
                check_field("detail", d)?;
            }
        }
        Reply::LoginOk | Reply::LoginFail | Reply::RegisterOk | Reply::RegisterFail => {}
    }
    let mut out = reply.to_string().into_bytes();
    out.push(HEADER_TERMINATOR);
    Ok(out)
}

/// Decode a reply. The terminating newline is optional for replies.
pub fn decode_reply(bytes: &[u8]) -> Result<Reply, FrameDecodeError> {
    let line = match bytes.iter().position(|&b| b == HEADER_TERMINATOR) {
        Some(end) => &bytes[..end],
        None => bytes,
    };
    let line = std::str::from_utf8(line).map_err(|_| FrameDecodeError::NotUtf8)?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    let expect = |kind: &'static str, n: usize| {
        if fields.len() == n {
            Ok(())
        } else {
            Err(FrameDecodeError::FieldCount {
                kind,
                expected: n,
                found: fields.len(),
            })
        }
    };
    let reply = match fields[0] {
        "START-ACK" => {
            expect("START-ACK", 2)?;
            Reply::StartAck {
                filename: fields[1].to_string(),
            }
        }
        "FRAGMENT-ACK" => {
            expect("FRAGMENT-ACK", 3)?;
            Reply::FragmentAck {
                filename: fields[1].to_string(),
                sequence: parse_int("sequence", fields[2])?,
            }
        }
        "END-ACK" => {
            expect("END-ACK", 2)?;
            Reply::EndAck {
                filename: fields[1].to_string(),
            }
        }
        "LOGIN-OK" => Reply::LoginOk,
        "LOGIN-FAIL" => Reply::LoginFail,
        "REGISTER-OK" => Reply::RegisterOk,
        "REGISTER-FAIL" => Reply::RegisterFail,
        "ERR" => {
            if fields.len() < 2 {
                return Err(FrameDecodeError::FieldCount {
                    kind: "ERR",
                    expected: 2,
                    found: fields.len(),
                });
            }
            Reply::Error {
                reason: ErrorReason::from_token(fields[1]),
                detail: fields[2..].iter().map(|s| s.to_string()).collect(),
            }
        }
        other => return Err(FrameDecodeError::UnknownKind(other.into())),
    };
    Ok(reply)
}

/// Replace bytes that would corrupt a header line. For free-form text such as error messages.
pub fn scrub(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            FIELD_DELIMITER | '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

fn split_header(bytes: &[u8]) -> Result<(&str, &[u8]), FrameDecodeError> {
    let end = bytes
        .iter()
        .position(|&b| b == HEADER_TERMINATOR)
        .ok_or(FrameDecodeError::MissingTerminator)?;
    let line = std::str::from_utf8(&bytes[..end]).map_err(|_| FrameDecodeError::NotUtf8)?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    Ok((line, &bytes[end + 1..]))
}

fn parse_int<T: FromStr>(field: &'static str, value: &str) -> Result<T, FrameDecodeError> {
    value
        .parse()
        .map_err(|_| FrameDecodeError::InvalidInteger {
            field,
            value: value.to_string(),
        })
}

/// Reject a header field that contains the delimiter or a line break.
pub fn check_field(name: &'static str, value: &str) -> Result<(), FrameEncodeError> {
    if value.contains(&[FIELD_DELIMITER, '\n', '\r'][..]) {
        return Err(FrameEncodeError::ForbiddenCharacter { field: name });
    }
    Ok(())
}

struct HeaderWriter {
    line: String,
}

impl HeaderWriter {
    fn new(tag: &str) -> Self {
        Self {
            line: tag.to_string(),
        }
    }

    fn field(&mut self, name: &'static str, value: &str) -> Result<(), FrameEncodeError> {
        check_field(name, value)?;
        self.line.push(FIELD_DELIMITER);
        self.line.push_str(value);
        Ok(())
    }

    fn finish(self, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
        let len = self.line.len() + 1 + payload.len();
        if len > MAX_DATAGRAM {
            return Err(FrameEncodeError::TooLarge(len));
        }
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(self.line.as_bytes());
        out.push(HEADER_TERMINATOR);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// Error encoding a message (unsafe header field or datagram size limit).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("field `{field}` contains a delimiter or line break")]
    ForbiddenCharacter { field: &'static str },
    #[error("datagram of {0} bytes exceeds the maximum")]
    TooLarge(usize),
}

/// Error decoding a datagram.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("no header terminator")]
    MissingTerminator,
    #[error("header is not valid UTF-8")]
    NotUtf8,
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("{kind} expects {expected} fields, found {found}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("field `{field}` is not an integer: `{value}`")]
    InvalidInteger { field: &'static str, value: String },
}
