//! Login and registration. One request, one awaited reply; never retransmitted.

use chute_core::{Reply, Request};

use crate::link::{Link, LinkError};

/// Ask the server whether `username`/`password` are valid.
pub async fn login(link: &Link, username: &str, password: &str) -> Result<bool, AccountError> {
    let request = Request::Login {
        username: username.to_string(),
        password: password.to_string(),
    };
    match link.exchange(&request).await? {
        Some(Reply::LoginOk) => Ok(true),
        Some(Reply::LoginFail) => Ok(false),
        Some(other) => Err(AccountError::Unexpected(other)),
        None => Err(AccountError::NoReply),
    }
}

/// Create an account. `Ok(false)` when the server refuses (name taken or empty).
pub async fn register(link: &Link, username: &str, password: &str) -> Result<bool, AccountError> {
    let request = Request::Register {
        username: username.to_string(),
        password: password.to_string(),
    };
    match link.exchange(&request).await? {
        Some(Reply::RegisterOk) => Ok(true),
        Some(Reply::RegisterFail) => Ok(false),
        Some(other) => Err(AccountError::Unexpected(other)),
        None => Err(AccountError::NoReply),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("no reply from server")]
    NoReply,
    #[error("unexpected reply `{0}`")]
    Unexpected(Reply),
    #[error(transparent)]
    Link(#[from] LinkError),
}
