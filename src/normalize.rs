use unicode_normalization::UnicodeNormalization;

/// Latin transliteration for Cyrillic letters, both cases. Hard and soft
/// signs have no Latin equivalent and map to the empty string.
fn transliterate_cyrillic(ch: char) -> Option<&'static str> {
    let mapped = match ch {
        'А' => "A",
        'Б' => "B",
        'В' => "V",
        'Г' => "G",
        'Д' => "D",
        'Е' | 'Ё' | 'Э' => "E",
        'Ж' => "ZH",
        'З' => "Z",
        'И' => "I",
        'Й' | 'Ы' => "Y",
        'К' => "K",
        'Л' => "L",
        'М' => "M",
        'Н' => "N",
        'О' => "O",
        'П' => "P",
        'Р' => "R",
        'С' => "S",
        'Т' => "T",
        'У' => "U",
        'Ф' => "F",
        'Х' => "KH",
        'Ц' => "TS",
        'Ч' => "CH",
        'Ш' => "SH",
        'Щ' => "SHCH",
        'Ъ' | 'Ь' => "",
        'Ю' => "YU",
        'Я' => "YA",
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' | 'ё' | 'э' => "e",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' | 'ы' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "kh",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' | 'ь' => "",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    };
    Some(mapped)
}

/// Canonical ASCII search key used for sorting and substring matching.
///
/// Transliterates Cyrillic, expands special letters to their conventional
/// digraphs, strips invisible formatting characters, decomposes to NFD and
/// drops combining marks, keeps only ASCII letters, digits, spaces and
/// hyphens, collapses whitespace runs, and uppercases. Idempotent and total.
pub fn normalize(text: &str) -> String {
    let mut translit = String::with_capacity(text.len());
    for ch in text.chars() {
        if let Some(mapped) = transliterate_cyrillic(ch) {
            translit.push_str(mapped);
            continue;
        }
        match ch {
            'ß' => translit.push_str("ss"),
            'Ø' => translit.push('O'),
            'ø' => translit.push('o'),
            'Ł' => translit.push('L'),
            'ł' => translit.push('l'),
            'Æ' => translit.push_str("AE"),
            'æ' => translit.push_str("ae"),
            'Œ' => translit.push_str("OE"),
            'œ' => translit.push_str("oe"),
            // Zero-width and word-joiner characters pasted in from web forms
            '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' => {}
            _ => translit.push(ch),
        }
    }

    let mut out = String::with_capacity(translit.len());
    let mut pending_space = false;
    for ch in translit.nfd() {
        if unicode_normalization::char::is_combining_mark(ch) {
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '-' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch.to_ascii_uppercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_diacritics() {
        assert_eq!(normalize("Müller"), "MULLER");
        assert_eq!(normalize("François"), "FRANCOIS");
        assert_eq!(normalize("  José  Ángel "), "JOSE ANGEL");
    }

    #[test]
    fn test_normalize_expands_special_letters() {
        assert_eq!(normalize("Straße"), "STRASSE");
        assert_eq!(normalize("Søren Kierkegaard"), "SOREN KIERKEGAARD");
        assert_eq!(normalize("Łukasz"), "LUKASZ");
        assert_eq!(normalize("Ærø"), "AERO");
        assert_eq!(normalize("Œuvre"), "OEUVRE");
    }

    #[test]
    fn test_normalize_transliterates_cyrillic() {
        assert_eq!(normalize("Жанна"), "ZHANNA");
        assert_eq!(normalize("Щербаков"), "SHCHERBAKOV");
        // Hard and soft signs vanish
        assert_eq!(normalize("Объект"), "OBEKT");
        assert_eq!(normalize("Юрий"), "YURIY");
    }

    #[test]
    fn test_normalize_keeps_digits_and_hyphens() {
        assert_eq!(normalize("Guinea-Bissau"), "GUINEA-BISSAU");
        assert_eq!(normalize("Agent 007"), "AGENT 007");
    }

    #[test]
    fn test_normalize_drops_symbols_and_invisibles() {
        assert_eq!(normalize("🇩🇪 Berlin"), "BERLIN");
        assert_eq!(normalize("A\u{200B}B\u{FEFF}C"), "ABC");
        assert_eq!(normalize("name@example.org"), "NAMEEXAMPLEORG");
    }

    #[test]
    fn test_normalize_is_idempotent_and_total() {
        for input in ["Müller", "Straße", "Жанна", "  a  b  ", "", "🎉"] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once);
        }
        assert_eq!(normalize(""), "");
    }
}
