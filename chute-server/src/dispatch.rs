//! Request dispatch: decode one datagram, route it by kind, produce exactly one reply.
//!
//! Every failure becomes an `ERR|...` reply; nothing here returns an error to the serve loop.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chute_core::wire::scrub;
use chute_core::{
    decode_request, fragment_count, ErrorReason, FrameDecodeError, Reply, Request,
};
use tokio::fs::File;

use crate::credentials::CredentialStore;
use crate::ledger::{TransferLedger, TransferRecord};
use crate::session::{Begun, SessionError, SessionKey, SessionStore};
use crate::storage;

/// Routes requests to the session store, credential store and ledger.
pub struct Dispatcher {
    sessions: SessionStore,
    storage_dir: PathBuf,
    max_upload_bytes: u64,
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn TransferLedger>,
}

impl Dispatcher {
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        max_upload_bytes: u64,
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn TransferLedger>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            storage_dir: storage_dir.into(),
            max_upload_bytes,
            credentials,
            ledger,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Decode and route one datagram.
    pub async fn handle_datagram(&self, datagram: &[u8]) -> Reply {
        match decode_request(datagram) {
            Ok(req) => self.handle(req).await,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable datagram");
                decode_error_reply(&e)
            }
        }
    }

    /// Route a decoded request.
    pub async fn handle(&self, req: Request) -> Reply {
        match req {
            Request::Start {
                filename,
                fragment_count,
                total_size,
                uploader,
            } => {
                self.on_start(filename, fragment_count, total_size, uploader)
                    .await
            }
            Request::Fragment {
                sequence,
                filename,
                uploader,
                payload,
            } => self.on_fragment(sequence, filename, uploader, &payload).await,
            Request::End { filename, uploader } => self.on_end(filename, uploader).await,
            Request::Login { username, password } => {
                let creds = self.credentials.clone();
                let user = username.clone();
                match tokio::task::spawn_blocking(move || creds.authenticate(&user, &password))
                    .await
                {
                    Ok(true) => {
                        tracing::info!(%username, "login ok");
                        Reply::LoginOk
                    }
                    Ok(false) => {
                        tracing::info!(%username, "login refused");
                        Reply::LoginFail
                    }
                    Err(e) => internal_error(&e),
                }
            }
            Request::Register { username, password } => {
                let creds = self.credentials.clone();
                let user = username.clone();
                match tokio::task::spawn_blocking(move || creds.create(&user, &password)).await {
                    Ok(true) => {
                        tracing::info!(%username, "registered");
                        Reply::RegisterOk
                    }
                    Ok(false) => Reply::RegisterFail,
                    Err(e) => internal_error(&e),
                }
            }
        }
    }

    async fn on_start(
        &self,
        filename: String,
        fragments: u32,
        total_size: u64,
        uploader: String,
    ) -> Reply {
        let max_fragments = fragment_count(self.max_upload_bytes).unwrap_or(u32::MAX);
        if total_size > self.max_upload_bytes || fragments > max_fragments {
            tracing::warn!(%uploader, %filename, total_size, "upload over size limit");
            return Reply::error(ErrorReason::TooLarge, [filename]);
        }
        let key = SessionKey::new(uploader, filename);
        let dir = self.storage_dir.clone();
        let name = key.filename.clone();
        let create = || async move {
            let (path, file) =
                tokio::task::spawn_blocking(move || storage::reserve_destination(&dir, &name))
                    .await
                    .map_err(io::Error::other)??;
            Ok::<_, io::Error>((path, File::from_std(file)))
        };
        let destination = match self
            .sessions
            .begin(key.clone(), fragments, total_size, create)
            .await
        {
            Ok(Begun::Reused) => {
                // Our START-ACK was lost and the client resent START.
                tracing::debug!(%key, "duplicate START acknowledged");
                return Reply::StartAck {
                    filename: key.filename,
                };
            }
            Ok(Begun::Fresh { destination }) => destination,
            Ok(Begun::Replaced {
                previous,
                destination,
            }) => {
                tracing::warn!(%key, previous = %previous.display(), "START replaced an open session");
                destination
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "cannot create destination file");
                return Reply::error(ErrorReason::Io, [key.filename, scrub(&e.to_string())]);
            }
        };

        let record = TransferRecord::new(
            key.filename.clone(),
            destination.clone(),
            total_size,
            fragments,
            key.uploader.clone(),
        );
        let ledger = self.ledger.clone();
        match tokio::task::spawn_blocking(move || ledger.record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%key, error = %e, "ledger record failed"),
            Err(e) => tracing::warn!(%key, error = %e, "ledger task failed"),
        }

        tracing::info!(
            %key,
            fragments,
            total_size,
            store = %destination.display(),
            "upload started"
        );
        Reply::StartAck {
            filename: key.filename,
        }
    }

    async fn on_fragment(
        &self,
        sequence: u32,
        filename: String,
        uploader: String,
        payload: &[u8],
    ) -> Reply {
        let key = SessionKey::new(uploader, filename);
        match self.sessions.write_fragment(&key, sequence, payload).await {
            Ok(()) => {
                tracing::trace!(%key, sequence, len = payload.len(), "fragment written");
                Reply::FragmentAck {
                    filename: key.filename,
                    sequence,
                }
            }
            Err(SessionError::NoSession) => {
                tracing::debug!(%key, sequence, "fragment without session");
                Reply::error(ErrorReason::NoMeta, [key.filename])
            }
            Err(SessionError::OutOfRange { .. }) => Reply::error(
                ErrorReason::OutOfRange,
                [key.filename, sequence.to_string()],
            ),
            Err(e @ SessionError::PayloadTooLarge(_)) => {
                Reply::error(ErrorReason::Malformed, [key.filename, scrub(&e.to_string())])
            }
            Err(e @ SessionError::Io(_)) => {
                tracing::error!(%key, sequence, error = %e, "fragment write failed; session aborted");
                Reply::error(ErrorReason::Io, [key.filename, scrub(&e.to_string())])
            }
        }
    }

    async fn on_end(&self, filename: String, uploader: String) -> Reply {
        let key = SessionKey::new(uploader, filename);
        match self.sessions.end(&key).await {
            Ok(closed) => {
                tracing::info!(
                    %key,
                    bytes = closed.bytes,
                    fragments = closed.fragment_count,
                    store = %closed.destination.display(),
                    "upload completed"
                );
                Reply::EndAck {
                    filename: key.filename,
                }
            }
            Err(SessionError::NoSession) => {
                tracing::debug!(%key, "END without session");
                Reply::error(ErrorReason::NoMeta, [key.filename])
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "closing upload failed");
                Reply::error(ErrorReason::Io, [key.filename, scrub(&e.to_string())])
            }
        }
    }
}

/// Reply for a datagram the codec rejected.
pub fn decode_error_reply(e: &FrameDecodeError) -> Reply {
    match e {
        FrameDecodeError::MissingTerminator => Reply::error(ErrorReason::NoHeader, []),
        FrameDecodeError::UnknownKind(tag) => Reply::error(ErrorReason::Unknown, [scrub(tag)]),
        other => Reply::error(ErrorReason::Malformed, [scrub(&other.to_string())]),
    }
}

fn internal_error(e: &tokio::task::JoinError) -> Reply {
    tracing::error!(error = %e, "handler task failed");
    Reply::error(ErrorReason::Internal, [])
}
