//! # Meeting-Point Tokens
//!
//! Deterministic derivation of the opaque rendezvous tokens registered
//! with the signaling server.
//!
//! ## Derivation
//!
//! ```text
//! daily (date D, UTC):
//!   token = "day_" || trunc22(base64url(SHA-256(min || max || "zajel:daily:" || YYYY-MM-DD)))
//!
//! hourly (hour H, UTC):
//!   token = "hr_" || trunc22(base64url(HMAC-SHA256(session_secret, "zajel:hourly:" || YYYY-MM-DDTHH)))
//! ```
//!
//! `min`/`max` are the two public keys in lexicographic byte order, so
//! both peers derive identical daily tokens regardless of which key is
//! "mine". Daily tokens bind to long-term keys and survive sessions;
//! hourly tokens bind to the session secret, so live-match pushes cannot
//! be linked to prior days' tokens without it.
//!
//! The 22-character truncation keeps 132 bits of entropy. A server-side
//! collision only produces a false-positive match attempt whose encrypted
//! dead drop cannot decrypt.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of daily tokens.
pub const DAILY_PREFIX: &str = "day_";

/// Prefix of hourly tokens.
pub const HOURLY_PREFIX: &str = "hr_";

/// Characters of base64url digest kept in a token body.
const TOKEN_BODY_LEN: usize = 22;

const DAILY_DOMAIN: &str = "zajel:daily:";
const HOURLY_DOMAIN: &str = "zajel:hourly:";

/// Daily tokens for yesterday, today, and tomorrow (UTC), derived from
/// the two peers' long-term public keys.
pub fn daily_points(my_public: &[u8], their_public: &[u8]) -> [String; 3] {
    daily_points_on(my_public, their_public, Utc::now().date_naive())
}

/// Stable-ID variant for peers that keep a non-cryptographic long-term
/// identifier.
pub fn daily_points_from_ids(my_id: &str, their_id: &str) -> [String; 3] {
    daily_points(my_id.as_bytes(), their_id.as_bytes())
}

/// Hourly tokens for the previous, current, and next hour (UTC), derived
/// from the session shared secret.
pub fn hourly_tokens(session_secret: &[u8]) -> [String; 3] {
    hourly_tokens_at(session_secret, Utc::now())
}

pub(crate) fn daily_points_on(
    my_public: &[u8],
    their_public: &[u8],
    today: NaiveDate,
) -> [String; 3] {
    let (min, max) = order_pair(my_public, their_public);
    [
        daily_point_for(min, max, today - Duration::days(1)),
        daily_point_for(min, max, today),
        daily_point_for(min, max, today + Duration::days(1)),
    ]
}

pub(crate) fn hourly_tokens_at(session_secret: &[u8], now: DateTime<Utc>) -> [String; 3] {
    let hour = now.with_minute(0).and_then(|t| t.with_second(0)).unwrap_or(now);
    [
        hourly_token_for(session_secret, hour - Duration::hours(1)),
        hourly_token_for(session_secret, hour),
        hourly_token_for(session_secret, hour + Duration::hours(1)),
    ]
}

/// Lexicographic byte order; the shorter input wins a shared-prefix tie.
fn order_pair<'a>(a: &'a [u8], b: &'a [u8]) -> (&'a [u8], &'a [u8]) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn daily_point_for(min: &[u8], max: &[u8], date: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(min);
    hasher.update(max);
    hasher.update(DAILY_DOMAIN.as_bytes());
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    token(DAILY_PREFIX, &hasher.finalize())
}

fn hourly_token_for(session_secret: &[u8], hour: DateTime<Utc>) -> String {
    let mut mac = HmacSha256::new_from_slice(session_secret)
        .expect("HMAC accepts keys of any length");
    mac.update(HOURLY_DOMAIN.as_bytes());
    mac.update(hour.format("%Y-%m-%dT%H").to_string().as_bytes());
    token(HOURLY_PREFIX, &mac.finalize().into_bytes())
}

fn token(prefix: &str, digest: &[u8]) -> String {
    let body = URL_SAFE_NO_PAD.encode(digest);
    format!("{}{}", prefix, &body[..TOKEN_BODY_LEN])
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_daily_points_commute() {
        let alice = b"alice-public-key";
        let bob = b"bob-public-key";
        let today = date(2025, 3, 14);
        assert_eq!(
            daily_points_on(alice, bob, today),
            daily_points_on(bob, alice, today)
        );
    }

    #[test]
    fn test_daily_points_from_ids_commute() {
        let a = daily_points_from_ids("stable-a", "stable-b");
        let b = daily_points_from_ids("stable-b", "stable-a");
        assert_eq!(a, b);
    }

    #[test]
    fn test_token_shape() {
        let today = date(2025, 3, 14);
        for token in daily_points_on(b"a", b"b", today) {
            assert!(token.starts_with(DAILY_PREFIX));
            assert_eq!(token.len(), DAILY_PREFIX.len() + 22);
        }
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        for token in hourly_tokens_at(b"secret", now) {
            assert!(token.starts_with(HOURLY_PREFIX));
            assert_eq!(token.len(), HOURLY_PREFIX.len() + 22);
        }
    }

    #[test]
    fn test_tokens_contain_no_padding() {
        let today = date(2025, 3, 14);
        for token in daily_points_on(b"a", b"b", today) {
            assert!(!token.contains('='));
        }
    }

    #[test]
    fn test_daily_window_covers_three_distinct_days() {
        let today = date(2025, 3, 14);
        let tokens = daily_points_on(b"alice", b"bob", today);
        assert_ne!(tokens[0], tokens[1]);
        assert_ne!(tokens[1], tokens[2]);
        assert_ne!(tokens[0], tokens[2]);

        // yesterday's "tomorrow" equals today's "today"
        let yesterday = daily_points_on(b"alice", b"bob", date(2025, 3, 13));
        assert_eq!(yesterday[2], tokens[1]);
    }

    #[test]
    fn test_hourly_window_slides_by_one_hour() {
        let secret = b"session-secret";
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let next = Utc.with_ymd_and_hms(2025, 3, 14, 16, 42, 1).unwrap();
        let current = hourly_tokens_at(secret, now);
        let later = hourly_tokens_at(secret, next);
        assert_eq!(current[2], later[1]);
        assert_eq!(current[1], later[0]);
    }

    #[test]
    fn test_hourly_tokens_bind_to_secret() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        assert_ne!(
            hourly_tokens_at(b"secret-one", now),
            hourly_tokens_at(b"secret-two", now)
        );
    }

    #[test]
    fn test_minute_and_second_do_not_change_hourly_tokens() {
        let secret = b"session-secret";
        let a = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 3, 14, 15, 59, 59).unwrap();
        assert_eq!(hourly_tokens_at(secret, a), hourly_tokens_at(secret, b));
    }

    #[test]
    fn test_distinct_key_pairs_get_distinct_tokens() {
        let today = date(2025, 3, 14);
        let ab = daily_points_on(b"alice", b"bob", today);
        let ac = daily_points_on(b"alice", b"carol", today);
        for token in &ab {
            assert!(!ac.contains(token));
        }
    }

    #[test]
    fn test_length_breaks_prefix_ties() {
        // "ab" vs "abc": one is a prefix of the other, ordering must still
        // be deterministic from both sides.
        let today = date(2025, 3, 14);
        assert_eq!(
            daily_points_on(b"ab", b"abc", today),
            daily_points_on(b"abc", b"ab", today)
        );
    }
}
