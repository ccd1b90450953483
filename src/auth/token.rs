use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};

/// 32 bytes = 256 bits of entropy.
const TOKEN_BYTES: usize = 32;

/// Opaque bearer token from OS entropy, URL-safe base64 without padding.
/// Used for session, email-verification and password-reset tokens.
pub fn generate_secure_token() -> String {
    let mut buffer = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buffer);
    URL_SAFE_NO_PAD.encode(buffer)
}
