//! Entity identifiers.
//!
//! Build and release ids are a one-letter prefix followed by uppercase
//! letters drawn from a fixed alphabet. Existing records reference these
//! strings, so the alphabet must not change.

use rand::Rng;

/// Alphabet for generated identifiers.
pub const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of random characters after the prefix.
pub const ID_LENGTH: usize = 10;

/// Generate `prefix` followed by `size` random uppercase letters.
pub fn generate_id(prefix: &str, size: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(prefix.len() + size);
    id.push_str(prefix);
    for _ in 0..size {
        let idx = rng.gen_range(0..ID_ALPHABET.len());
        id.push(ID_ALPHABET[idx] as char);
    }
    id
}

pub fn build_id() -> String {
    generate_id("B", ID_LENGTH)
}

pub fn release_id() -> String {
    generate_id("R", ID_LENGTH)
}

/// Process id for a scheduler task ARN: the last dash-separated segment.
pub fn arn_to_pid(arn: &str) -> &str {
    arn.rsplit('-').next().unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ids_have_prefix_and_length() {
        let id = build_id();
        assert_eq!(id.len(), 11);
        assert!(id.starts_with('B'));
        assert!(id[1..].bytes().all(|b| b.is_ascii_uppercase()));
    }

    #[test]
    fn release_ids_have_prefix() {
        let id = release_id();
        assert!(id.starts_with('R'));
        assert_eq!(id.len(), 11);
    }

    #[test]
    fn pid_is_last_arn_segment() {
        assert_eq!(
            arn_to_pid("arn:aws:ecs:us-east-1:778743527532:task/50b8de99-f94f-4ecd-a98f-5850760f0845"),
            "5850760f0845"
        );
        assert_eq!(arn_to_pid("plain"), "plain");
    }
}
