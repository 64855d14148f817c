//! Structural checks on the inbound chat message and the sanitizer applied
//! before a message is forwarded upstream.

/// Maximum accepted message length in bytes.
pub const MAX_MESSAGE_LEN: usize = 1000;

/// A message is accepted when it is between 1 and 1000 bytes and every
/// character is printable ASCII (0x20–0x7E) or ASCII whitespace.  Anything
/// else is reported as invalid rather than raised; the caller maps the
/// result to a client error.
pub fn is_valid_message(message: &str) -> bool {
    if message.is_empty() || message.len() > MAX_MESSAGE_LEN {
        return false;
    }
    message
        .chars()
        .all(|c| matches!(c, '\x20'..='\x7e') || c.is_ascii_whitespace())
}

/// Strips angle brackets, braces, quotes and backslashes from the message
/// and trims surrounding whitespace.  Runs only after validation passes.
/// Idempotent: sanitizing already-sanitized text is a no-op.
pub fn sanitize_message(message: &str) -> String {
    let stripped: String = message
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '{' | '}' | '\'' | '"' | '\\'))
        .collect();
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_messages() {
        assert!(!is_valid_message(""));
        assert!(!is_valid_message(&"a".repeat(MAX_MESSAGE_LEN + 1)));
        assert!(is_valid_message(&"a".repeat(MAX_MESSAGE_LEN)));
        assert!(is_valid_message("a"));
    }

    #[test]
    fn rejects_non_printable_and_non_ascii_characters() {
        assert!(!is_valid_message("hello\u{7}world"));
        assert!(!is_valid_message("héllo"));
        assert!(!is_valid_message("emoji \u{1F600}"));
    }

    #[test]
    fn accepts_ascii_whitespace() {
        assert!(is_valid_message("hello\tworld\nsecond line"));
    }

    #[test]
    fn sanitizer_strips_markup_and_quote_characters() {
        assert_eq!(
            sanitize_message(r#"  <b>{hi}</b> 'quoted' "twice" back\slash  "#),
            "bhi/b quoted twice backslash"
        );
    }

    #[test]
    fn sanitizer_is_idempotent() {
        let once = sanitize_message(r#"say <hello> to {the} "world"\"#);
        let twice = sanitize_message(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitizer_preserves_clean_text() {
        assert_eq!(
            sanitize_message("Hello, how are you?"),
            "Hello, how are you?"
        );
    }
}
