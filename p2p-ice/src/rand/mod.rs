use shared::util::{RUNES_BASE64, generate_crypto_random_string};

#[cfg(test)]
mod rand_test;

/// Length of port username fragments, passwords and relay credentials.
pub const LEN_CREDENTIAL: usize = 16;

/// Generates a port username fragment.
/// This internally uses `generate_crypto_random_string`.
pub fn generate_ufrag() -> String {
    generate_crypto_random_string(LEN_CREDENTIAL, RUNES_BASE64)
}

/// Generates a port password.
/// This internally uses `generate_crypto_random_string`.
pub fn generate_pwd() -> String {
    generate_crypto_random_string(LEN_CREDENTIAL, RUNES_BASE64)
}
