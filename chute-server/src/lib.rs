//! Chute upload server: session store, request dispatch, credential store and transfer ledger
//! behind a UDP serve loop. The binary in `main.rs` wires these together from [`config::Config`].

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod ledger;
pub mod server;
pub mod session;
pub mod storage;

pub use config::{Config, ConfigError};
pub use credentials::{CredentialError, CredentialStore, FileCredentialStore};
pub use dispatch::Dispatcher;
pub use ledger::{JsonLinesLedger, LedgerError, TransferLedger, TransferRecord};
pub use server::Server;
pub use session::{SessionError, SessionKey, SessionStore};
