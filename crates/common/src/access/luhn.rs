//! Luhn mod 32 check digit over the base32 alphabet.
//!
//! Detects any single-character transcription error in an access code.

use super::{base32, CodeError};

/// Append the check character to `text`.
pub fn generate(text: &str) -> Result<String, CodeError> {
    let mut factor = 2u32;
    let mut sum = 0u32;
    let n = 32u32;

    for c in text.chars().rev() {
        let mut addend = factor * base32::ord(c)? as u32;
        factor = if factor == 2 { 1 } else { 2 };
        addend = addend / n + addend % n;
        sum += addend;
    }

    let check = (n - sum % n) % n;
    let mut out = text.to_uppercase();
    out.push(base32::chr(check as u8)?);
    Ok(out)
}

/// Verify the trailing check character, returning the text without it.
pub fn verify(text: &str) -> Result<&str, CodeError> {
    // The alphabet is ASCII; anything else makes the byte slice below
    // unsound and can never carry a valid code.
    if let Some(c) = text.chars().find(|c| !c.is_ascii()) {
        return Err(CodeError::InvalidCharacter(c));
    }
    if text.is_empty() {
        return Err(CodeError::ChecksumMismatch);
    }
    let data = &text[..text.len() - 1];
    if generate(data)? == text.to_uppercase() {
        Ok(data)
    } else {
        Err(CodeError::ChecksumMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_verify() {
        let checked = generate("CLEARSKIES").unwrap();
        assert_eq!(checked.len(), 11);
        assert_eq!(verify(&checked).unwrap(), "CLEARSKIES");
    }

    #[test]
    fn verify_is_case_insensitive() {
        let checked = generate("SYNCABLE").unwrap();
        assert!(verify(&checked.to_lowercase()).is_ok());
    }

    #[test]
    fn multibyte_input_is_an_error_not_a_panic() {
        assert!(matches!(
            verify("ABCDé"),
            Err(CodeError::InvalidCharacter('é'))
        ));
        assert!(verify("é").is_err());
    }

    #[test]
    fn single_character_errors_detected() {
        let checked = generate("ABCDEFGH").unwrap();
        for pos in 0..checked.len() {
            for sub in ['A', 'Q', 'Z', '7'] {
                let mut corrupted: Vec<char> = checked.chars().collect();
                if corrupted[pos] == sub {
                    continue;
                }
                corrupted[pos] = sub;
                let corrupted: String = corrupted.into_iter().collect();
                assert!(
                    verify(&corrupted).is_err(),
                    "corruption at {pos} ({sub}) went undetected: {corrupted}"
                );
            }
        }
    }
}
