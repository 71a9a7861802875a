//! Upload driver: runs the reliability engine against a [`Link`] and a local file.
//!
//! The file is read sequentially, one fragment per step, and each step's datagram is
//! encoded once and resent verbatim on retry. Progress goes out as [`UploadEvent`]s.

use std::path::{Path, PathBuf};

use chute_core::{encode_request, Progress, Step, Upload, UploadError, UploadEvent};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::link::{Link, LinkError};

/// What to upload and as whom.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    /// Name announced to the server; defaults to the file name of `path`.
    pub remote_name: Option<String>,
    pub uploader: String,
    /// Attempts per step.
    pub retry_limit: u32,
}

/// Outcome of an upload whose END was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub filename: String,
    pub bytes: u64,
    pub fragment_count: u32,
    /// Hex SHA-256 of the bytes sent.
    pub sha256: String,
}

/// A running upload.
pub struct UploadHandle {
    events: mpsc::UnboundedReceiver<UploadEvent>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<UploadReport, TransferError>>,
}

impl UploadHandle {
    /// Stop before the next send. A reply already being awaited is abandoned.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Next progress event; `None` once the upload task has finished and all events were read.
    pub async fn next_event(&mut self) -> Option<UploadEvent> {
        self.events.recv().await
    }

    pub async fn wait(self) -> Result<UploadReport, TransferError> {
        self.task.await?
    }
}

/// Run `request` on its own task.
pub fn spawn_upload(link: Link, request: UploadRequest) -> UploadHandle {
    let (events_tx, events) = mpsc::unbounded_channel();
    let (cancel, cancel_rx) = watch::channel(false);
    let task =
        tokio::spawn(async move { upload_file(&link, &request, &events_tx, cancel_rx).await });
    UploadHandle {
        events,
        cancel,
        task,
    }
}

/// Upload one file: START, every fragment in order, END. Each step waits for its acknowledgement.
pub async fn upload_file(
    link: &Link,
    request: &UploadRequest,
    events: &mpsc::UnboundedSender<UploadEvent>,
    mut cancel: watch::Receiver<bool>,
) -> Result<UploadReport, TransferError> {
    let remote_name = match &request.remote_name {
        Some(n) => n.clone(),
        None => file_name(&request.path)?,
    };
    let io_err = |source: std::io::Error| TransferError::Io {
        path: request.path.clone(),
        source,
    };
    let mut file = File::open(&request.path).await.map_err(io_err)?;
    let total_size = file.metadata().await.map_err(io_err)?.len();
    let mut upload = Upload::new(
        remote_name,
        request.uploader.as_str(),
        total_size,
        request.retry_limit,
    )?;
    let fragment_count = upload.fragment_count();
    let emit = |event| {
        let _ = events.send(event);
    };
    emit(UploadEvent::Started {
        filename: upload.filename().to_string(),
        fragment_count,
        total_size,
    });
    tracing::info!(
        file = %request.path.display(),
        filename = upload.filename(),
        total_size,
        fragment_count,
        server = %link.server(),
        "upload starting"
    );

    let mut hasher = Sha256::new();
    let mut encoded_step: Option<Step> = None;
    let mut datagram = Vec::new();
    while let Some(step) = upload.step() {
        if *cancel.borrow() {
            return Err(TransferError::Cancelled);
        }
        if encoded_step != Some(step) {
            let req = match step {
                Step::Start => upload.start_request(),
                Step::Fragment(id) => {
                    let mut payload = vec![0u8; id.len()];
                    file.read_exact(&mut payload).await.map_err(io_err)?;
                    hasher.update(&payload);
                    upload.fragment_request(id, payload)
                }
                Step::End => upload.end_request(),
            };
            datagram = encode_request(&req).map_err(UploadError::from)?;
            encoded_step = Some(step);
        }

        let reply = tokio::select! {
            r = link.exchange_raw(&datagram) => r?,
            Ok(()) = cancel.changed() => return Err(TransferError::Cancelled),
        };

        let progress = match &reply {
            Some(r) => upload.on_reply(r),
            None => upload.on_timeout(),
        };
        match progress {
            Progress::Advanced {
                completed: Step::Fragment(id),
            } => {
                tracing::debug!(sequence = id.sequence, fragment_count, "fragment acknowledged");
                emit(UploadEvent::FragmentAcked {
                    sequence: id.sequence,
                    fragment_count,
                });
            }
            Progress::Advanced { completed } => {
                tracing::debug!(%completed, "acknowledged");
            }
            Progress::Retry { attempt, cause } => {
                tracing::warn!(%step, attempt, ?cause, "no acknowledgement; resending");
                emit(UploadEvent::Retrying {
                    step,
                    attempt,
                    cause,
                });
            }
            Progress::Failed(error) => {
                tracing::error!(%error, "upload failed");
                emit(UploadEvent::Failed {
                    error: error.clone(),
                });
                return Err(error.into());
            }
            Progress::Idle => break,
        }
    }

    let report = UploadReport {
        filename: upload.filename().to_string(),
        bytes: total_size,
        fragment_count,
        sha256: to_hex(&hasher.finalize()),
    };
    tracing::info!(filename = %report.filename, bytes = report.bytes, sha256 = %report.sha256, "upload complete");
    emit(UploadEvent::Completed {
        filename: report.filename.clone(),
        total_size,
    });
    Ok(report)
}

fn file_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::NoFileName(path.to_path_buf()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("upload cancelled")]
    Cancelled,
    #[error("upload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chute_core::{decode_request, encode_reply, Reply, Request};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    /// Peer that acknowledges everything, dropping the first reply to each fragment.
    async fn lossy_acker() -> (String, JoinHandle<Vec<Request>>) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 65536];
            let mut dropped = std::collections::HashSet::new();
            loop {
                let (n, from) = peer.recv_from(&mut buf).await.unwrap();
                let req = decode_request(&buf[..n]).unwrap();
                seen.push(req.clone());
                let reply = match req {
                    Request::Start { filename, .. } => Reply::StartAck { filename },
                    Request::Fragment {
                        sequence, filename, ..
                    } => {
                        if dropped.insert(sequence) {
                            continue;
                        }
                        Reply::FragmentAck { filename, sequence }
                    }
                    Request::End { filename, .. } => {
                        peer.send_to(&encode_reply(&Reply::EndAck { filename }).unwrap(), from)
                            .await
                            .unwrap();
                        return seen;
                    }
                    _ => continue,
                };
                peer.send_to(&encode_reply(&reply).unwrap(), from).await.unwrap();
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn lost_acks_are_retried_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (addr, peer) = lossy_acker().await;
        let link = Link::connect(&addr, Duration::from_millis(100)).await.unwrap();
        let mut handle = spawn_upload(
            link,
            UploadRequest {
                path,
                remote_name: None,
                uploader: "alice".into(),
                retry_limit: 4,
            },
        );
        let mut events = Vec::new();
        while let Some(e) = handle.next_event().await {
            events.push(e);
        }
        let report = handle.wait().await.unwrap();
        assert_eq!(report.filename, "data.bin");
        assert_eq!(report.fragment_count, 2);
        assert_eq!(report.sha256, to_hex(&Sha256::digest(&data)));

        let retries = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
        assert!(matches!(events.last(), Some(UploadEvent::Completed { .. })));

        // Each fragment was sent twice with identical payloads.
        let seen = peer.await.unwrap();
        let fragments: Vec<_> = seen
            .iter()
            .filter_map(|r| match r {
                Request::Fragment {
                    sequence, payload, ..
                } => Some((*sequence, payload.len())),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, vec![(0, 1400), (0, 1400), (1, 600), (1, 600)]);
    }

    #[tokio::test]
    async fn cancel_stops_a_waiting_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Link::connect(&silent.local_addr().unwrap().to_string(), Duration::from_secs(30))
            .await
            .unwrap();
        let mut handle = spawn_upload(
            link,
            UploadRequest {
                path,
                remote_name: Some("renamed.txt".into()),
                uploader: "alice".into(),
                retry_limit: 4,
            },
        );
        assert!(matches!(
            handle.next_event().await,
            Some(UploadEvent::Started { .. })
        ));
        handle.cancel();
        let r = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(r, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Link::connect(&silent.local_addr().unwrap().to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_cancel, cancel_rx) = watch::channel(false);
        let r = upload_file(
            &link,
            &UploadRequest {
                path: PathBuf::from("/definitely/not/here.bin"),
                remote_name: None,
                uploader: "alice".into(),
                retry_limit: 1,
            },
            &tx,
            cancel_rx,
        )
        .await;
        assert!(matches!(r, Err(TransferError::Io { .. })));
    }
}
