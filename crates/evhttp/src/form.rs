//! `application/x-www-form-urlencoded` decoding.

use std::collections::HashMap;

use tracing::debug;

/// Decode a form body into key/value pairs. Later duplicates win.
///
/// `+` becomes a space and `%XX` the byte `0xXX`; malformed escapes stay
/// literal and invalid UTF-8 is replaced.
pub fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(body) {
        Ok(pairs) => pairs.into_iter().collect(),
        Err(e) => {
            debug!(error = %e, "undecodable form body");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(form: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
        form.get(key).map(String::as_str)
    }

    #[test]
    fn test_decode_escapes() {
        let form = parse_urlencoded("a=a+b&b=%41%62c&c=%e4%bd%a0&d=plain");
        assert_eq!(value(&form, "a"), Some("a b"));
        assert_eq!(value(&form, "b"), Some("Abc"));
        assert_eq!(value(&form, "c"), Some("你"));
        assert_eq!(value(&form, "d"), Some("plain"));
    }

    #[test]
    fn test_malformed_percent_kept() {
        let form = parse_urlencoded("a=100%&b=%zz&c=%4");
        assert_eq!(value(&form, "a"), Some("100%"));
        assert_eq!(value(&form, "b"), Some("%zz"));
        assert_eq!(value(&form, "c"), Some("%4"));
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let form = parse_urlencoded("k=%ff");
        assert_eq!(value(&form, "k"), Some("\u{fffd}"));
    }

    #[test]
    fn test_encoder_roundtrip() {
        for s in ["user name", "p@ss&w=rd", "100% sure+", "ünïcödé/?#"] {
            let encoded = serde_urlencoded::to_string([("username", s), (s, "v")]).unwrap();
            let form = parse_urlencoded(&encoded);
            assert_eq!(value(&form, "username"), Some(s));
            assert_eq!(value(&form, s), Some("v"));
        }
    }

    #[test]
    fn test_parse_urlencoded() {
        let form = parse_urlencoded("username=alice&password=p%40ss+1&flag&=x&&username=bob");
        assert_eq!(value(&form, "username"), Some("bob"));
        assert_eq!(value(&form, "password"), Some("p@ss 1"));
        assert_eq!(value(&form, "flag"), Some(""));
        assert_eq!(value(&form, ""), Some("x"));
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_urlencoded("").is_empty());
    }
}
