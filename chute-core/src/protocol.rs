//! Chute wire protocol: message kinds, reply kinds and fixed constants.

use std::fmt;
use std::time::Duration;

/// Payload bytes carried by one FRAGMENT datagram. Kept under common path MTU.
pub const FRAGMENT_SIZE: usize = 1400;

/// Largest UDP payload either side expects to receive.
pub const MAX_DATAGRAM: usize = 65507;

/// Default server UDP port.
pub const DEFAULT_PORT: u16 = 12345;

/// Attempts per protocol step (START, each FRAGMENT, END) before the upload fails.
pub const DEFAULT_RETRY_LIMIT: u32 = 4;

/// How long the client waits for each reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Separator between header fields.
pub const FIELD_DELIMITER: char = '|';

/// Terminator of the header line.
pub const HEADER_TERMINATOR: u8 = b'\n';

/// A request sent from client to server. One per datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Opens an upload session on the server.
    Start {
        filename: String,
        fragment_count: u32,
        total_size: u64,
        uploader: String,
    },
    /// One slice of the file; `payload` is the raw tail of the datagram.
    Fragment {
        sequence: u32,
        filename: String,
        uploader: String,
        payload: Vec<u8>,
    },
    /// Closes the upload session.
    End { filename: String, uploader: String },
    Login { username: String, password: String },
    Register { username: String, password: String },
}

impl Request {
    /// The kind tag written as the first header field.
    pub fn kind(&self) -> Kind {
        match self {
            Request::Start { .. } => Kind::Start,
            Request::Fragment { .. } => Kind::Fragment,
            Request::End { .. } => Kind::End,
            Request::Login { .. } => Kind::Login,
            Request::Register { .. } => Kind::Register,
        }
    }
}

/// Request kinds, as tagged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Start,
    Fragment,
    End,
    Login,
    Register,
}

impl Kind {
    pub fn tag(self) -> &'static str {
        match self {
            Kind::Start => "START",
            Kind::Fragment => "FRAGMENT",
            Kind::End => "END",
            Kind::Login => "LOGIN",
            Kind::Register => "REGISTER",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "START" => Some(Kind::Start),
            "FRAGMENT" => Some(Kind::Fragment),
            "END" => Some(Kind::End),
            "LOGIN" => Some(Kind::Login),
            "REGISTER" => Some(Kind::Register),
            _ => None,
        }
    }

    /// Header field count including the tag.
    pub fn field_count(self) -> usize {
        match self {
            Kind::Start => 5,
            Kind::Fragment => 4,
            Kind::End | Kind::Login | Kind::Register => 3,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A reply sent from server to client. Header-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    StartAck { filename: String },
    FragmentAck { filename: String, sequence: u32 },
    EndAck { filename: String },
    LoginOk,
    LoginFail,
    RegisterOk,
    RegisterFail,
    /// `ERR|<reason>|<detail>...`
    Error {
        reason: ErrorReason,
        detail: Vec<String>,
    },
}

impl Reply {
    pub fn error(reason: ErrorReason, detail: impl IntoIterator<Item = String>) -> Self {
        Reply::Error {
            reason,
            detail: detail.into_iter().collect(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::StartAck { filename } => write!(f, "START-ACK|{filename}"),
            Reply::FragmentAck { filename, sequence } => {
                write!(f, "FRAGMENT-ACK|{filename}|{sequence}")
            }
            Reply::EndAck { filename } => write!(f, "END-ACK|{filename}"),
            Reply::LoginOk => f.write_str("LOGIN-OK"),
            Reply::LoginFail => f.write_str("LOGIN-FAIL"),
            Reply::RegisterOk => f.write_str("REGISTER-OK"),
            Reply::RegisterFail => f.write_str("REGISTER-FAIL"),
            Reply::Error { reason, detail } => {
                write!(f, "ERR|{reason}")?;
                for d in detail {
                    write!(f, "|{d}")?;
                }
                Ok(())
            }
        }
    }
}

/// Reason token carried by an `ERR` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    /// Datagram had no header terminator.
    NoHeader,
    /// Header present but fields were wrong (count, integers, encoding, payload size).
    Malformed,
    /// Unrecognized kind tag.
    Unknown,
    /// FRAGMENT or END for a key with no open session.
    NoMeta,
    /// Filesystem failure on the server.
    Io,
    /// Upload exceeds the server's size limit.
    TooLarge,
    /// Fragment sequence beyond the session's fragment count.
    OutOfRange,
    /// The handler failed unexpectedly.
    Internal,
    /// Any token this build does not know.
    Other(String),
}

impl ErrorReason {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorReason::NoHeader => "NO_HEADER",
            ErrorReason::Malformed => "MALFORMED",
            ErrorReason::Unknown => "UNKNOWN",
            ErrorReason::NoMeta => "NO_META",
            ErrorReason::Io => "IO",
            ErrorReason::TooLarge => "TOO_LARGE",
            ErrorReason::OutOfRange => "OUT_OF_RANGE",
            ErrorReason::Internal => "INTERNAL",
            ErrorReason::Other(s) => s,
        }
    }

    pub fn from_token(token: &str) -> Self {
        match token {
            "NO_HEADER" => ErrorReason::NoHeader,
            "MALFORMED" => ErrorReason::Malformed,
            "UNKNOWN" => ErrorReason::Unknown,
            "NO_META" => ErrorReason::NoMeta,
            "IO" => ErrorReason::Io,
            "TOO_LARGE" => ErrorReason::TooLarge,
            "OUT_OF_RANGE" => ErrorReason::OutOfRange,
            "INTERNAL" => ErrorReason::Internal,
            other => ErrorReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
