//! Chute upload client: UDP link, login/registration, and the upload driver.

pub mod account;
pub mod config;
pub mod link;
pub mod transfer;

pub use account::{login, register, AccountError};
pub use config::{Config, ConfigError};
pub use link::{Link, LinkError};
pub use transfer::{
    spawn_upload, upload_file, TransferError, UploadHandle, UploadReport, UploadRequest,
};
