//! Bearer token handling: structure parsing, claim decoding, signature
//! verification and the refresh credential types.

pub mod claims;
pub mod pair;
pub mod verify;

pub use claims::{AccessToken, JwtClaims, extract_claims, is_expired, parse};
pub use pair::{MIN_REFRESH_TOKEN_LENGTH, RefreshToken, TokenPair};
pub use verify::verify_signature;
