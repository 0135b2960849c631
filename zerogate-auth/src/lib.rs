//! Token contract between the identity service and the data plane.
//!
//! The gateway only ever consumes tokens. It accepts Ed25519-signed JWTs
//! whose `alg` header is `EdDSA`, whose signature verifies against the
//! control-plane-supplied public key, whose expiry has not passed, and
//! whose purpose is `target`. Everything else is rejected before a
//! session exists. Key material can rotate at any time; a verifier is
//! cheap to rebuild and is swapped on config install.

mod keys;
mod token;

pub use keys::Keypair;
pub use token::{Claims, TokenPurpose, TokenVerifier};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token purpose {0:?} is not accepted here")]
    WrongPurpose(TokenPurpose),

    #[error("token tenant {got} does not match gateway tenant {expected}")]
    TenantMismatch { expected: String, got: String },

    #[error("invalid key material: {0}")]
    Key(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;
