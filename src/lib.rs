// Real-time communication core: messaging session, resumable transfers, E2E crypto
pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod session;
pub mod storage;
pub mod transfer;

// Re-export main types for convenience
pub use config::CoreConfig;
pub use crypto::{CryptoService, FileKeyStore, KeyStore, PeerPublicKey};
pub use error::{CoreError, ErrorKind, Result};
pub use models::*;
pub use session::{MessagingSession, SessionEvent};
pub use storage::{Checkpoint, CheckpointStore, PermissionStore};
pub use transfer::{Direction, PauseOrigin, TransferConfig, TransferEvent, TransferInfo, TransferManager, TransferOffer};
