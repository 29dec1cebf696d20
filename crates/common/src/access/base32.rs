//! Base32 as used by the access-code text format.
//!
//! Not RFC 4648: the alphabet is `A`-`Z` followed by `2`-`9`, there is no
//! padding, and decoding maps the visually ambiguous `0` to `O` and `1` to
//! `L` so codes survive being read over the phone or copied by hand.

use super::CodeError;

/// Value of a single base32 character.
///
/// Accepts lowercase and substitutes `0`/`1` before lookup.
pub fn ord(c: char) -> Result<u8, CodeError> {
    let c = match c.to_ascii_uppercase() {
        '0' => 'O',
        '1' => 'L',
        other => other,
    };
    match c {
        'A'..='Z' => Ok(c as u8 - b'A'),
        '2'..='9' => Ok(c as u8 - b'2' + 26),
        _ => Err(CodeError::InvalidCharacter(c)),
    }
}

/// Character for a 5-bit value.
pub fn chr(val: u8) -> Result<char, CodeError> {
    match val {
        0..=25 => Ok((b'A' + val) as char),
        26..=31 => Ok((b'2' + val - 26) as char),
        _ => Err(CodeError::InvalidValue(val)),
    }
}

/// Encode bytes to base32. The input length must be a multiple of 5 so the
/// output needs no padding.
pub fn encode(data: &[u8]) -> Result<String, CodeError> {
    if data.len() % 5 != 0 {
        return Err(CodeError::BadEncodeLength(data.len()));
    }

    let mut out = String::with_capacity(data.len() * 8 / 5);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(chr(((acc >> bits) & 0x1f) as u8)?);
        }
    }
    Ok(out)
}

/// Decode base32 to bytes, dropping any trailing partial byte.
pub fn decode(text: &str) -> Result<Vec<u8>, CodeError> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for c in text.chars() {
        acc = (acc << 5) | ord(c)? as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    Ok(out)
}
