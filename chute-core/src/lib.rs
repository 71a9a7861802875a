//! Chute protocol reference implementation.
//! Host-driven: no sockets or files; hosts pass datagrams and events in and get messages and decisions back.

pub mod fragment;
pub mod protocol;
pub mod upload;
pub mod wire;

pub use fragment::{fragment_at, fragment_count, fragment_offset, FragmentId};
pub use protocol::{
    ErrorReason, Kind, Reply, Request, DEFAULT_PORT, DEFAULT_REPLY_TIMEOUT, DEFAULT_RETRY_LIMIT,
    FRAGMENT_SIZE, MAX_DATAGRAM,
};
pub use upload::{Progress, RetryCause, Step, Upload, UploadError, UploadEvent};
pub use wire::{
    decode_reply, decode_request, encode_reply, encode_request, FrameDecodeError,
    FrameEncodeError,
};
