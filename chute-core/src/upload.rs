//! Client reliability engine: host-driven stop-and-wait upload.
//!
//! The engine performs no I/O. The host asks for the current [`Step`], builds and
//! sends its request, then reports either the reply it received or a timeout. The
//! engine answers with a [`Progress`]: advance, resend the same request, or give up.
//! Exactly one request is outstanding at a time, and every step (START, each
//! FRAGMENT, END) gets the same attempt budget.

use std::fmt;

use crate::fragment::{self, FragmentId};
use crate::protocol::{Reply, Request};
use crate::wire::{self, FrameEncodeError};

/// One protocol step of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Start,
    Fragment(FragmentId),
    End,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Start => f.write_str("START"),
            Step::Fragment(id) => write!(f, "fragment {}", id.sequence),
            Step::End => f.write_str("END"),
        }
    }
}

/// Why the current request must be sent again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    Timeout,
    /// A reply arrived but did not acknowledge the outstanding request.
    Unexpected(Reply),
}

/// Engine answer to a reply or timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// `completed` was acknowledged; [`Upload::step`] now returns the next step, or `None` when done.
    Advanced { completed: Step },
    /// Resend the same request. `attempt` counts attempts used so far on this step.
    Retry { attempt: u32, cause: RetryCause },
    /// Attempt budget exhausted; the upload is over and nothing more may be sent.
    Failed(UploadError),
    /// The upload already finished; the event was ignored.
    Idle,
}

/// Progress notifications for a front end. Carries no presentation text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Started {
        filename: String,
        fragment_count: u32,
        total_size: u64,
    },
    FragmentAcked {
        sequence: u32,
        fragment_count: u32,
    },
    Retrying {
        step: Step,
        attempt: u32,
        cause: RetryCause,
    },
    Completed {
        filename: String,
        total_size: u64,
    },
    Failed {
        error: UploadError,
    },
}

/// State of one upload.
#[derive(Debug)]
pub struct Upload {
    filename: String,
    uploader: String,
    total_size: u64,
    fragment_count: u32,
    retry_limit: u32,
    step: Option<Step>,
    attempts: u32,
}

impl Upload {
    /// Plan an upload of `total_size` bytes. `retry_limit` is the number of attempts per step (at least 1).
    pub fn new(
        filename: impl Into<String>,
        uploader: impl Into<String>,
        total_size: u64,
        retry_limit: u32,
    ) -> Result<Self, UploadError> {
        let filename = filename.into();
        let uploader = uploader.into();
        if filename.is_empty() {
            return Err(UploadError::EmptyFilename);
        }
        wire::check_field("filename", &filename)?;
        wire::check_field("uploader", &uploader)?;
        let fragment_count =
            fragment::fragment_count(total_size).ok_or(UploadError::TooLarge(total_size))?;
        Ok(Self {
            filename,
            uploader,
            total_size,
            fragment_count,
            retry_limit: retry_limit.max(1),
            step: Some(Step::Start),
            attempts: 0,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// Current step, or `None` once the upload completed or failed.
    pub fn step(&self) -> Option<Step> {
        self.step
    }

    pub fn start_request(&self) -> Request {
        Request::Start {
            filename: self.filename.clone(),
            fragment_count: self.fragment_count,
            total_size: self.total_size,
            uploader: self.uploader.clone(),
        }
    }

    /// FRAGMENT request for `id` carrying `payload` (the bytes of `id.start..id.end`).
    pub fn fragment_request(&self, id: FragmentId, payload: Vec<u8>) -> Request {
        Request::Fragment {
            sequence: id.sequence,
            filename: self.filename.clone(),
            uploader: self.uploader.clone(),
            payload,
        }
    }

    pub fn end_request(&self) -> Request {
        Request::End {
            filename: self.filename.clone(),
            uploader: self.uploader.clone(),
        }
    }

    /// A reply arrived for the outstanding request.
    pub fn on_reply(&mut self, reply: &Reply) -> Progress {
        let Some(step) = self.step else {
            return Progress::Idle;
        };
        if self.acknowledges(step, reply) {
            self.advance(step)
        } else {
            tracing::debug!(%step, %reply, "reply does not match outstanding request");
            self.consume_attempt(step, RetryCause::Unexpected(reply.clone()))
        }
    }

    /// No reply within the host's timeout.
    pub fn on_timeout(&mut self) -> Progress {
        let Some(step) = self.step else {
            return Progress::Idle;
        };
        self.consume_attempt(step, RetryCause::Timeout)
    }

    fn acknowledges(&self, step: Step, reply: &Reply) -> bool {
        match (step, reply) {
            (Step::Start, Reply::StartAck { filename }) => *filename == self.filename,
            (Step::Fragment(id), Reply::FragmentAck { filename, sequence }) => {
                *filename == self.filename && *sequence == id.sequence
            }
            (Step::End, Reply::EndAck { filename }) => *filename == self.filename,
            _ => false,
        }
    }

    fn advance(&mut self, completed: Step) -> Progress {
        self.attempts = 0;
        self.step = match completed {
            Step::Start => self.fragment_step(0).or(Some(Step::End)),
            Step::Fragment(id) => self.fragment_step(id.sequence + 1).or(Some(Step::End)),
            Step::End => None,
        };
        Progress::Advanced { completed }
    }

    fn fragment_step(&self, sequence: u32) -> Option<Step> {
        fragment::fragment_at(sequence, self.total_size).map(Step::Fragment)
    }

    fn consume_attempt(&mut self, step: Step, cause: RetryCause) -> Progress {
        self.attempts += 1;
        if self.attempts < self.retry_limit {
            return Progress::Retry {
                attempt: self.attempts,
                cause,
            };
        }
        let last_reply = match cause {
            RetryCause::Timeout => None,
            RetryCause::Unexpected(reply) => Some(reply),
        };
        let attempts = self.attempts;
        self.step = None;
        Progress::Failed(match step {
            Step::Start => UploadError::StartRejected {
                attempts,
                last_reply,
            },
            Step::Fragment(id) => UploadError::FragmentRejected {
                sequence: id.sequence,
                attempts,
                last_reply,
            },
            Step::End => UploadError::EndNotConfirmed {
                attempts,
                last_reply,
            },
        })
    }
}

fn describe(last_reply: &Option<Reply>) -> String {
    match last_reply {
        Some(reply) => format!("last reply `{reply}`"),
        None => "no reply".to_string(),
    }
}

/// Why an upload stopped. Each protocol step fails with its own variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("START not acknowledged after {attempts} attempts ({})", describe(.last_reply))]
    StartRejected {
        attempts: u32,
        last_reply: Option<Reply>,
    },
    #[error("fragment {sequence} not acknowledged after {attempts} attempts ({})", describe(.last_reply))]
    FragmentRejected {
        sequence: u32,
        attempts: u32,
        last_reply: Option<Reply>,
    },
    #[error("END not confirmed after {attempts} attempts ({}); all fragments were acknowledged", describe(.last_reply))]
    EndNotConfirmed {
        attempts: u32,
        last_reply: Option<Reply>,
    },
    #[error("filename is empty")]
    EmptyFilename,
    #[error("file of {0} bytes has too many fragments")]
    TooLarge(u64),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}
