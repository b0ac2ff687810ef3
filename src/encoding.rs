//! Mojibake repair for text that was decoded as Latin-1 but is really UTF-8.
//!
//! Registration sheets collected over the years carry names like `Ã«` where
//! the source meant `ë`. The repair targets exactly that failure mode and
//! nothing else.

/// Detect and reverse UTF-8-as-Latin-1 double encoding.
///
/// If any character lies above U+00FF the text already contains genuine wide
/// characters and byte-level reinterpretation would be unsafe, so the input
/// is returned unchanged. Otherwise the characters are reinterpreted as raw
/// bytes and decoded as UTF-8 when suspicious lead bytes are present. Any
/// decode failure falls back to the original text; this function never fails.
pub fn repair(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut bytes = Vec::with_capacity(text.len());
    let mut lead_bytes = 0usize;
    for ch in text.chars() {
        let code = ch as u32;
        if code > 0xFF {
            return text.to_string();
        }
        // 0xC2-0xDF and 0xE0-0xEF are the lead bytes of 2- and 3-byte UTF-8
        // sequences; seeing them as Latin-1 code points is the tell.
        if (0xC2..=0xDF).contains(&code) || (0xE0..=0xEF).contains(&code) {
            lead_bytes += 1;
        }
        bytes.push(code as u8);
    }

    if lead_bytes == 0 {
        return text.to_string();
    }

    match String::from_utf8(bytes) {
        Ok(decoded) => decoded,
        Err(_) => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_double_encoded_two_byte_sequences() {
        assert_eq!(repair("Ã«"), "ë");
        assert_eq!(repair("Ã¶"), "ö");
        assert_eq!(repair("naÃ¯ve"), "naïve");
        assert_eq!(repair("JosÃ© GarcÃ­a"), "José García");
    }

    #[test]
    fn test_repair_leaves_clean_ascii_alone() {
        assert_eq!(repair("Plain ASCII name"), "Plain ASCII name");
        assert_eq!(repair(""), "");
    }

    #[test]
    fn test_repair_leaves_wide_characters_alone() {
        assert_eq!(repair("日本語"), "日本語");
        assert_eq!(repair("Müller 日本"), "Müller 日本");
    }

    #[test]
    fn test_repair_falls_back_on_invalid_sequences() {
        // A lone lead byte is not a valid UTF-8 sequence.
        assert_eq!(repair("Ã"), "Ã");
        // Lead byte followed by ASCII is invalid as UTF-8 as well.
        assert_eq!(repair("Ãx"), "Ãx");
    }

    #[test]
    fn test_repair_leaves_plain_latin1_text_alone() {
        // Diacritics outside the lead-byte ranges are legitimate Latin-1 text.
        assert_eq!(repair("Müller"), "Müller");
    }
}
