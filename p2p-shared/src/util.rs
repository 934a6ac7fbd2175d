use rand::{Rng, rng};

/// Characters that may appear in a base64 encoded string.
pub const RUNES_BASE64: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// generate_crypto_random_string generates a random string of length `n` over `runes`.
pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = rng();

    let rand_string: String = (0..n)
        .map(|_| {
            let idx = rng.random_range(0..runes.len());
            runes[idx] as char
        })
        .collect();

    rand_string
}

/// is_base64 reports whether every character of `s` belongs to the base64 alphabet,
/// `=` padding included.
pub fn is_base64(s: &str) -> bool {
    s.bytes().all(|b| b == b'=' || RUNES_BASE64.contains(&b))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_random_string_uses_runes() {
        let s = generate_crypto_random_string(64, b"ab");
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_is_base64() {
        assert!(is_base64("abcXYZ019+/="));
        assert!(is_base64(""));
        assert!(!is_base64("abc-def"));
        assert!(!is_base64("with space"));
    }
}
