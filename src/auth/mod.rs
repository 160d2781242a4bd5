//! Authentication: anonymous identities carried in signed tokens.

mod identity;
mod jwt;

pub use identity::{AnonymousIdentity, Identity, IdentityProvider};
pub use jwt::{Claims, JwtSecret};
