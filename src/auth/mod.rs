//! Authentication module
//!
//! Token issuance/validation, the token verification stage and passphrase checks.

mod jwt;
mod middleware;
mod password;

pub use jwt::{Claims, TokenFactory, TokenPair, TokenType};
pub use middleware::{verify_token, TokenVerifier};
pub use password::verify_passphrase;
