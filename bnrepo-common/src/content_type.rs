//! Content-type detection for backends that do not store one.

/// Number of leading bytes hierarchical backends read for sniffing.
pub const SNIFF_LEN: usize = 8192;

const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type of `head` (the first bytes of the file named `key`).
///
/// Magic numbers win; otherwise UTF-8 text is `text/plain` unless the
/// extension names a more specific textual type; otherwise the extension
/// guess, falling back to `application/octet-stream`.
pub fn sniff(key: &str, head: &[u8]) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }

    let guess = mime_guess::from_path(key).first();

    if !head.is_empty() && looks_like_text(head) {
        return match guess {
            Some(m) if is_textual(&m) => m.essence_str().to_string(),
            _ => "text/plain".to_string(),
        };
    }

    guess
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Guess from the key alone, used when storing objects.
pub fn guess_from_key(key: &str) -> String {
    mime_guess::from_path(key)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

fn is_textual(m: &mime_guess::Mime) -> bool {
    m.type_() == mime_guess::mime::TEXT
        || matches!(m.subtype().as_str(), "json" | "xml" | "javascript")
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // a multi-byte sequence may be cut at the end of the sniff window
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > head.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    #[test]
    fn test_sniff_text() {
        assert_eq!(sniff("notes.txt", b"Neque porro quisquam est"), "text/plain");
        assert_eq!(sniff("no_extension", b"plain words"), "text/plain");
        assert_eq!(sniff("data.json", b"{\"a\": 1}"), "application/json");
    }

    #[test]
    fn test_sniff_magic_beats_extension() {
        assert_eq!(sniff("image.txt", PNG_HEADER), "image/png");
    }

    #[test]
    fn test_sniff_binary_falls_back_to_extension() {
        assert_eq!(sniff("archive.unknownext", &[0, 1, 2, 3]), OCTET_STREAM);
        assert_eq!(sniff("doc.pdf", &[0, 159, 146, 150]), "application/pdf");
    }

    #[test]
    fn test_truncated_utf8_is_text() {
        let mut head = "grüß".as_bytes().to_vec();
        head.pop();
        assert!(looks_like_text(&head));
    }

    #[test]
    fn test_guess_from_key() {
        assert_eq!(guess_from_key("a/b/logo.png"), "image/png");
        assert_eq!(guess_from_key("a/b/blob"), OCTET_STREAM);
    }
}
