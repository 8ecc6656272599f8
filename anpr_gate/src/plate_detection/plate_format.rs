//! Plate template `LLDDDLL`: letters at positions 0, 1, 5, 6 and digits at 2, 3, 4.
//!
//! OCR regularly swaps characters that look alike across the letter/digit boundary, so each
//! position also accepts the look-alikes of its class and canonicalization rewrites them.
//! The two tables are not inverses of each other: `J` becomes `3` in a digit slot but `3`
//! becomes `B` in a letter slot, and both `3` and `8` become `B`.

pub const PLATE_LEN: usize = 7;

fn is_digit_position(index: usize) -> bool {
    (2..=4).contains(&index)
}

/// Replacement for a letter read where a digit belongs.
fn letter_to_digit(c: char) -> Option<char> {
    match c {
        'O' => Some('0'),
        'I' => Some('1'),
        'J' => Some('3'),
        'B' => Some('8'),
        'S' => Some('5'),
        _ => None,
    }
}

/// Replacement for a digit read where a letter belongs.
fn digit_to_letter(c: char) -> Option<char> {
    match c {
        '0' => Some('O'),
        '1' => Some('I'),
        '3' => Some('B'),
        '8' => Some('B'),
        '5' => Some('S'),
        _ => None,
    }
}

/// Uppercases and strips spaces.
pub fn normalize(raw: &str) -> String {
    raw.to_uppercase().replace(' ', "")
}

/// Checks the template, allowing look-alikes in every position.
pub fn complies_format(text: &str) -> bool {
    if text.chars().count() != PLATE_LEN {
        return false;
    }

    text.chars().enumerate().all(|(i, c)| {
        if is_digit_position(i) {
            c.is_ascii_digit() || letter_to_digit(c).is_some()
        } else {
            c.is_alphabetic() || digit_to_letter(c).is_some()
        }
    })
}

/// Rewrites look-alikes into the class their position requires. Other characters pass through.
pub fn canonicalize(text: &str) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| {
            if is_digit_position(i) {
                letter_to_digit(c).unwrap_or(c)
            } else {
                digit_to_letter(c).unwrap_or(c)
            }
        })
        .collect()
}

/// Full treatment of one raw OCR string: normalize, validate, canonicalize.
pub fn parse_plate(raw: &str) -> Option<String> {
    let text = normalize(raw);
    if complies_format(&text) {
        Some(canonicalize(&text))
    } else {
        None
    }
}
