mod claims;
mod verifier;

pub use claims::{Claims, DEFAULT_TENANT_ID};
pub use verifier::{AuthContext, AuthError, IdentityVerifier, JwtVerifier, ROLE_PUBLISHER};
