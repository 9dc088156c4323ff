#![forbid(unsafe_code)]

pub mod code;
pub mod owner;
pub mod protocol;
pub mod record;

pub use code::{CodeCodec, PublicCode};
pub use owner::{CallerIdentity, OwnerKey};
pub use record::{DownloadEvent, FileRecord, NewFileRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("code must be exactly six ASCII digits")]
    InvalidCode,
    #[error("multiplier {multiplier} is not coprime with {modulus}")]
    MultiplierNotCoprime { multiplier: u64, modulus: u64 },
    #[error("internal identifier must be positive, got {0}")]
    InvalidInternalId(i64),
    #[error("exactly one of user or session must own a record")]
    InvalidOwnership,
    #[error("invalid session identifier")]
    InvalidSessionId,
}
