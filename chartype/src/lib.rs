#![cfg_attr(not(test), no_std)]

use core::str;

/// First byte of an element or attribute name.
pub const FIRST_NAME: u8 = 0x01;
/// Any byte of an element or attribute name.
pub const NAME: u8 = 0x02;
pub const WHITESPACE: u8 = 0x04;
/// Element content that needs no further inspection.
pub const TEXT: u8 = 0x08;
/// Attribute value content that needs no further inspection.
pub const ATTRIBUTE_TEXT: u8 = 0x10;
/// Whitespace that may form a standalone whitespace node. Carriage
/// returns are excluded so they always reach the normalization path.
pub const SPECIAL_WHITESPACE: u8 = 0x20;
pub const COMMENT: u8 = 0x40;

const fn classify_byte(b: u8) -> u8 {
    let mut class = 0;

    match b {
        b'\t' | b'\n' => class |= WHITESPACE | SPECIAL_WHITESPACE | TEXT | COMMENT,
        b'\r' => class |= WHITESPACE | COMMENT,
        b' ' => class |= WHITESPACE | SPECIAL_WHITESPACE | TEXT | ATTRIBUTE_TEXT | COMMENT,
        b'<' | b'&' => class |= COMMENT,
        b'"' | b'\'' => class |= TEXT | COMMENT,
        b']' => class |= ATTRIBUTE_TEXT | COMMENT,
        0x21..=0x7E => class |= TEXT | ATTRIBUTE_TEXT | COMMENT,
        // 0xEF keeps no content classes so every scanner stops on it
        // and runs the U+FFFE / U+FFFF check.
        0xEF => {}
        0x80..=0xFF => class |= TEXT | ATTRIBUTE_TEXT | COMMENT,
        _ => {}
    }

    match b {
        b'A'..=b'Z' | b'a'..=b'z' | b'_' => class |= FIRST_NAME | NAME,
        b'0'..=b'9' | b'.' | b'-' => class |= NAME,
        0x80..=0xFF => class |= FIRST_NAME | NAME,
        _ => {}
    }

    class
}

/// One class byte per input byte, so the scanners branch on a single
/// indexed load instead of a chain of range tests.
pub const CHAR_CLASS: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = classify_byte(i as u8);
        i += 1;
    }
    table
};

#[inline]
#[must_use]
pub const fn class_of(byte: u8) -> u8 {
    CHAR_CLASS[byte as usize]
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for u8 {}
    impl Sealed for char {}
    impl Sealed for [u8] {}
}

pub trait ByteExt: sealed::Sealed {
    #[must_use]
    fn is_first_name_byte(&self) -> bool;

    #[must_use]
    fn is_name_byte(&self) -> bool;

    #[must_use]
    fn is_space_byte(&self) -> bool;

    #[must_use]
    fn is_text_byte(&self) -> bool;

    #[must_use]
    fn is_attribute_text_byte(&self) -> bool;

    #[must_use]
    fn is_special_space_byte(&self) -> bool;

    #[must_use]
    fn is_comment_byte(&self) -> bool;
}

impl ByteExt for u8 {
    #[inline]
    fn is_first_name_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & FIRST_NAME != 0
    }

    #[inline]
    fn is_name_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & NAME != 0
    }

    #[inline]
    fn is_space_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & WHITESPACE != 0
    }

    #[inline]
    fn is_text_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & TEXT != 0
    }

    #[inline]
    fn is_attribute_text_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & ATTRIBUTE_TEXT != 0
    }

    #[inline]
    fn is_special_space_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & SPECIAL_WHITESPACE != 0
    }

    #[inline]
    fn is_comment_byte(&self) -> bool {
        CHAR_CLASS[*self as usize] & COMMENT != 0
    }
}

pub trait CharExt: sealed::Sealed {
    #[must_use]
    fn is_nc_name_start_char(&self) -> bool;

    #[must_use]
    fn is_nc_name_char(&self) -> bool;
}

impl CharExt for char {
    #[inline]
    fn is_nc_name_start_char(&self) -> bool {
        matches!(
            self,
            'A'..='Z'
                | '_'
                | 'a'..='z'
                | '\u{C0}'..='\u{D6}'
                | '\u{D8}'..='\u{F6}'
                | '\u{F8}'..='\u{2FF}'
                | '\u{370}'..='\u{37D}'
                | '\u{37F}'..='\u{1FFF}'
                | '\u{200C}'..='\u{200D}'
                | '\u{2070}'..='\u{218F}'
                | '\u{2C00}'..='\u{2FEF}'
                | '\u{3001}'..='\u{D7FF}'
                | '\u{F900}'..='\u{FDCF}'
                | '\u{FDF0}'..='\u{FFFD}'
                | '\u{10000}'..='\u{EFFFF}'
        )
    }

    #[inline]
    fn is_nc_name_char(&self) -> bool {
        self.is_nc_name_start_char()
            || matches!(
                self,
                '-' | '.' | '0'..='9' | '\u{B7}' | '\u{300}'..='\u{36F}' | '\u{203F}'..='\u{2040}'
            )
    }
}

pub trait SliceExt: sealed::Sealed {
    #[must_use]
    fn is_nc_name(&self) -> bool;
}

impl SliceExt for [u8] {
    fn is_nc_name(&self) -> bool {
        let s = match str::from_utf8(self) {
            Ok(s) => s,
            Err(_) => return false,
        };

        let mut chars = s.chars();

        match chars.next() {
            Some(first) => first.is_nc_name_start_char() && chars.all(|c| c.is_nc_name_char()),
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn special_whitespace_is_whitespace(b in prop::num::u8::ANY) {
            if b.is_special_space_byte() {
                prop_assert!(b.is_space_byte());
            }
        }

        #[test]
        fn first_name_bytes_are_name_bytes(b in prop::num::u8::ANY) {
            if b.is_first_name_byte() {
                prop_assert!(b.is_name_byte());
            }
        }

        #[test]
        fn text_bytes_are_legal_in_comments(b in prop::num::u8::ANY) {
            if b.is_text_byte() {
                prop_assert!(b.is_comment_byte());
            }
        }

        #[test]
        fn attribute_text_bytes_are_legal_in_comments(b in prop::num::u8::ANY) {
            if b.is_attribute_text_byte() {
                prop_assert!(b.is_comment_byte());
            }
        }
    }

    #[test]
    fn carriage_return_never_joins_content() {
        assert!(b'\r'.is_space_byte());
        assert!(!b'\r'.is_special_space_byte());
        assert!(!b'\r'.is_text_byte());
        assert!(!b'\r'.is_attribute_text_byte());
    }

    #[test]
    fn markup_starters_stop_every_content_scan() {
        for b in [b'<', b'&'] {
            assert!(!b.is_text_byte());
            assert!(!b.is_attribute_text_byte());
            assert!(b.is_comment_byte());
        }
    }

    #[test]
    fn quotes_stop_attribute_values_but_not_text() {
        for b in [b'"', b'\''] {
            assert!(b.is_text_byte());
            assert!(!b.is_attribute_text_byte());
        }
    }

    #[test]
    fn right_bracket_stops_text_but_not_attribute_values() {
        assert!(!b']'.is_text_byte());
        assert!(b']'.is_attribute_text_byte());
    }

    #[test]
    fn multibyte_lead_ef_keeps_only_the_name_bits() {
        assert_eq!(class_of(0xEF), FIRST_NAME | NAME);
    }

    #[test]
    fn other_high_bytes_keep_all_content_bits() {
        for b in 0x80..=0xFFu8 {
            if b == 0xEF {
                continue;
            }
            assert_eq!(
                class_of(b),
                FIRST_NAME | NAME | TEXT | ATTRIBUTE_TEXT | COMMENT,
                "byte {b:#04x}",
            );
        }
    }

    #[test]
    fn control_bytes_have_no_classes() {
        for b in (0x00..0x20u8).filter(|b| !matches!(b, b'\t' | b'\n' | b'\r')) {
            assert_eq!(class_of(b), 0, "byte {b:#04x}");
        }
    }

    #[test]
    fn name_bytes_cover_ascii_name_characters() {
        for b in b'a'..=b'z' {
            assert!(b.is_first_name_byte());
        }
        for b in b'0'..=b'9' {
            assert!(!b.is_first_name_byte());
            assert!(b.is_name_byte());
        }
        assert!(b'_'.is_first_name_byte());
        for b in [b'.', b'-'] {
            assert!(!b.is_first_name_byte());
            assert!(b.is_name_byte());
        }
        assert!(!b':'.is_name_byte());
    }

    mod nc_name {
        use super::*;

        #[test]
        fn accepts_ascii_names() {
            assert!(b"alpha".is_nc_name());
            assert!(b"_a-1.2".is_nc_name());
        }

        #[test]
        fn accepts_multibyte_names() {
            assert!("élément".as_bytes().is_nc_name());
            assert!("名前".as_bytes().is_nc_name());
        }

        #[test]
        fn rejects_empty_names() {
            assert!(!b"".is_nc_name());
        }

        #[test]
        fn rejects_leading_digits_and_punctuation() {
            assert!(!b"1a".is_nc_name());
            assert!(!b"-a".is_nc_name());
            assert!(!b".a".is_nc_name());
        }

        #[test]
        fn rejects_colons() {
            assert!(!b"a:b".is_nc_name());
        }

        #[test]
        fn rejects_bytes_that_are_not_utf8() {
            assert!(!b"a\xFF".is_nc_name());
        }
    }
}
