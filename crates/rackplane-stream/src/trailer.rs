//! Exit-code trailer written after a session's output.

/// Marks the final line of a session; the exit code follows it.
pub const STATUS_CODE_PREFIX: &str = "F1E49A85-0AD7-4AEF-A618-C249C6E6568D:";

pub fn trailer(code: i32) -> String {
    format!("{STATUS_CODE_PREFIX}{code}\n")
}

/// Split session output into the program's bytes and its exit code.
///
/// Returns `None` when the output carries no trailer, which means the
/// channel dropped before the program finished.
pub fn parse_trailer(output: &[u8]) -> Option<(&[u8], i32)> {
    let prefix = STATUS_CODE_PREFIX.as_bytes();
    let at = output
        .windows(prefix.len())
        .rposition(|window| window == prefix)?;
    let rest = std::str::from_utf8(&output[at + prefix.len()..]).ok()?;
    let code = rest.trim_end_matches('\n').parse().ok()?;
    Some((&output[..at], code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_line_shape() {
        assert_eq!(trailer(0), "F1E49A85-0AD7-4AEF-A618-C249C6E6568D:0\n");
        assert_eq!(trailer(-1), "F1E49A85-0AD7-4AEF-A618-C249C6E6568D:-1\n");
    }

    #[test]
    fn parse_separates_output_from_code() {
        let mut output = b"hello\n".to_vec();
        output.extend_from_slice(trailer(42).as_bytes());

        let (body, code) = parse_trailer(&output).unwrap();
        assert_eq!(body, b"hello\n");
        assert_eq!(code, 42);
    }

    #[test]
    fn missing_trailer_is_none() {
        assert!(parse_trailer(b"hello\n").is_none());
        assert!(parse_trailer(format!("{STATUS_CODE_PREFIX}oops\n").as_bytes()).is_none());
    }
}
