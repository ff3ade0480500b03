//! # Pairing Codes
//!
//! Generation and validation of the six-symbol ephemeral rendezvous codes.
//!
//! ## Alphabet
//!
//! 32 symbols: `A-Z` minus the ambiguous `O` and `I`, plus `2-9`. The size
//! is chosen so that a random byte reduces to a symbol index without
//! modulo bias: `floor(256 / 32) * 32 == 256`, so every byte value is
//! usable and the index is just the low five bits.
//!
//! ## Rejection sampling
//!
//! Generation still carries a rejection branch. With the current alphabet
//! it never triggers, but it is what keeps the sampler unbiased if the
//! alphabet ever shrinks (a 30-symbol set would reject bytes >= 240).
//! The byte source is the operating system CSPRNG; there is no fallback.

use rand::rngs::OsRng;
use rand::RngCore;

/// The pairing-code alphabet: A-Z without O/I, plus 2-9. Exactly 32 symbols.
pub const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of symbols in a pairing code.
pub const CODE_LENGTH: usize = 6;

/// Generate a pairing code: six symbols drawn uniformly from [`ALPHABET`].
///
/// Collision probability between any two codes is `32^-6`, roughly one in
/// a billion.
pub fn generate() -> String {
    generate_from_alphabet(ALPHABET)
}

/// Generate a code over an arbitrary alphabet (at most 256 symbols).
///
/// Rejection sampling: bytes at or above `floor(256 / n) * n` are redrawn
/// so the remaining range divides evenly into `n` symbols.
pub(crate) fn generate_from_alphabet(alphabet: &[u8]) -> String {
    debug_assert!(!alphabet.is_empty() && alphabet.len() <= 256);
    let n = alphabet.len();
    let limit = (256 / n) * n;

    let mut out = String::with_capacity(CODE_LENGTH);
    let mut buf = [0u8; 1];
    while out.len() < CODE_LENGTH {
        OsRng.fill_bytes(&mut buf);
        let byte = buf[0] as usize;
        if byte >= limit {
            continue;
        }
        out.push(alphabet[byte % n] as char);
    }
    out
}

/// Validate a candidate pairing code.
///
/// Returns true iff, after trimming and uppercasing, the candidate is
/// exactly six symbols and every symbol is in [`ALPHABET`].
pub fn validate(candidate: &str) -> bool {
    let normalized = normalize(candidate);
    normalized.len() == CODE_LENGTH
        && normalized.bytes().all(|b| ALPHABET.contains(&b))
}

/// Trim and uppercase a candidate code. Codes compare case-insensitively.
pub fn normalize(candidate: &str) -> String {
    candidate.trim().to_uppercase()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_generate_produces_valid_codes() {
        for _ in 0..200 {
            let code = generate();
            assert!(validate(&code), "Generated invalid code: {}", code);
        }
    }

    #[test]
    fn test_alphabet_has_32_symbols() {
        assert_eq!(ALPHABET.len(), 32);
        assert!(!ALPHABET.contains(&b'O'));
        assert!(!ALPHABET.contains(&b'I'));
        assert!(!ALPHABET.contains(&b'0'));
        assert!(!ALPHABET.contains(&b'1'));
    }

    #[test]
    fn test_validate_accepts_lowercase_and_whitespace() {
        assert!(validate("abcdef"));
        assert!(validate("  ABCDEF  "));
        assert!(validate("q7p3r8"));
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(!validate(""));
        assert!(!validate("ABCDE"));
        assert!(!validate("ABCDEFG"));
        assert!(!validate("ABCDE0")); // 0 not in alphabet
        assert!(!validate("ABCDEO")); // O not in alphabet
        assert!(!validate("ABC DE"));
        assert!(!validate("ABCDÉF"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(" q7p3r8 "), "Q7P3R8");
    }

    #[test]
    fn test_symbol_distribution_is_roughly_uniform() {
        // 20k codes = 120k symbols, ~3750 expected per symbol. A 3-sigma
        // band for a binomial with p = 1/32 is about +/- 180.
        let mut counts: HashMap<char, u64> = HashMap::new();
        let samples = 20_000;
        for _ in 0..samples {
            for c in generate().chars() {
                *counts.entry(c).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 32, "Some symbols never appeared");

        let total = (samples * CODE_LENGTH) as f64;
        let expected = total / 32.0;
        let sigma = (total * (1.0 / 32.0) * (31.0 / 32.0)).sqrt();
        for (symbol, count) in counts {
            let deviation = (count as f64 - expected).abs();
            assert!(
                deviation < 4.0 * sigma,
                "Symbol {} count {} deviates {:.1} from expected {:.1}",
                symbol,
                count,
                deviation,
                expected
            );
        }
    }

    #[test]
    fn test_rejection_sampling_with_shrunk_alphabet() {
        // 30-symbol alphabet: bytes >= 240 must be redrawn, and the output
        // stays unbiased over the smaller set.
        let alphabet = &ALPHABET[..30];
        let mut counts: HashMap<char, u64> = HashMap::new();
        let samples = 20_000;
        for _ in 0..samples {
            let code = generate_from_alphabet(alphabet);
            assert_eq!(code.len(), CODE_LENGTH);
            for c in code.chars() {
                assert!(alphabet.contains(&(c as u8)));
                *counts.entry(c).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 30);

        let total = (samples * CODE_LENGTH) as f64;
        let expected = total / 30.0;
        let sigma = (total * (1.0 / 30.0) * (29.0 / 30.0)).sqrt();
        for (symbol, count) in counts {
            let deviation = (count as f64 - expected).abs();
            assert!(
                deviation < 4.0 * sigma,
                "Symbol {} count {} deviates from uniform",
                symbol,
                count
            );
        }
    }
}
