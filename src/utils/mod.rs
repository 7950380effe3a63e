//! Utility functions and helpers.

pub mod http;
pub mod log;

use url::form_urlencoded;

/// Decode an object key as delivered in storage event notifications.
///
/// Keys arrive form-urlencoded: spaces as `+`, everything else percent
/// encoded.
pub fn decode_object_key(raw: &str) -> String {
    form_urlencoded::parse(format!("k={raw}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

/// True if `key` is under `prefix`. An empty prefix matches everything.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("raw/2024-01.csv"), "raw/2024-01.csv");
        assert_eq!(
            decode_object_key("raw/work+data%282%29.csv"),
            "raw/work data(2).csv"
        );
        assert_eq!(decode_object_key("raw/a%2Bb.csv"), "raw/a+b.csv");
        assert_eq!(decode_object_key("raw/a%26b%3Dc.csv"), "raw/a&b=c.csv");
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("raw/2024-01.csv", "raw/"));
        assert!(!matches_prefix("work_schedule/u1/x.csv", "raw/"));
        assert!(matches_prefix("anything", ""));
    }
}
