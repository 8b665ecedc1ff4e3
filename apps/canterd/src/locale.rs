//! Locale rules for player-facing names and wire strings.
//!
//! The client's code page encodes Hangul syllables as two bytes and Latin
//! letters as one; name length limits are enforced against that encoding,
//! not the UTF-8 byte count. Conversion itself is a passthrough seam: the
//! places that would consult a codepage table funnel through
//! [`to_wire`]/[`from_wire`].

const MIN_LATIN_LETTER_COUNT: usize = 3;
const MIN_KOREAN_LETTER_COUNT: usize = 2;

const WIDE_BYTE_COUNT: usize = 2;
const NARROW_BYTE_COUNT: usize = 1;

fn is_hangul_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

fn is_latin_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Validates a character name against the client's rules.
///
/// Allowed letters are Hangul syllables and `[A-Za-z0-9._-]`, nothing else.
/// The encoded length may not exceed `max_byte_capacity`; the minimum length
/// is two codepoints for pure-Hangul names and three otherwise. Digits count
/// as Latin, so a Hangul name with digits is held to the Latin minimum.
pub fn is_name_valid(input: &str, max_byte_capacity: usize) -> bool {
    if input.is_empty() {
        return false;
    }

    let mut korean_letters = 0usize;
    let mut latin_letters = 0usize;
    let mut codepoints = 0usize;

    for c in input.chars() {
        codepoints += 1;
        if is_hangul_syllable(c) {
            korean_letters += 1;
        } else if is_latin_name_char(c) {
            latin_letters += 1;
        } else {
            return false;
        }
    }

    let encoded_bytes = korean_letters * WIDE_BYTE_COUNT + latin_letters * NARROW_BYTE_COUNT;
    if encoded_bytes > max_byte_capacity {
        return false;
    }

    let is_pure_korean = latin_letters == 0 && korean_letters > 0;
    let min_letters = if is_pure_korean {
        MIN_KOREAN_LETTER_COUNT
    } else {
        MIN_LATIN_LETTER_COUNT
    };

    codepoints >= min_letters
}

/// Converts a wire string to UTF-8.
pub fn from_wire(input: &str) -> String {
    input.to_owned()
}

/// Converts a UTF-8 string to its wire form.
pub fn to_wire(input: &str) -> String {
    input.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        for name in [
            "validName1",
            "valid-name2",
            "valid_name3",
            "valid.name4",
            "가123-",
            "가가.가가9",
            "가가",
        ] {
            assert!(is_name_valid(name, 16), "{name:?} should be valid");
        }
    }

    #[test]
    fn rejects_invalid_names() {
        for name in [
            "",
            // Too long once encoded.
            "invalidLatinNameBEcauseOfLength211",
            "가가가가가가가가가가가가",
            // Symbols outside the allowed classes.
            "%!@^",
            "name with space",
            // Below the minimum letter counts.
            "ab",
            "가",
        ] {
            assert!(!is_name_valid(name, 16), "{name:?} should be invalid");
        }
    }

    #[test]
    fn hangul_counts_two_bytes() {
        // Eight syllables encode to exactly sixteen bytes.
        assert!(is_name_valid("가가가가가가가가", 16));
        // Nine overflow.
        assert!(!is_name_valid("가가가가가가가가가", 16));
    }

    #[test]
    fn mixed_names_use_latin_minimum() {
        assert!(!is_name_valid("가1", 16));
        assert!(is_name_valid("가12", 16));
    }
}
