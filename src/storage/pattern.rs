//! Key patterns for `KEYS`.
//!
//! Only three wildcard shapes are understood: `*`, `prefix*` and `*suffix`.
//! A pattern with no `*` names one exact key. Any other placement of `*`
//! (interior, or at both ends of a longer pattern) matches nothing.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    All,
    Prefix(Bytes),
    Suffix(Bytes),
    Exact(Bytes),
    Unsupported,
}

impl KeyPattern {
    pub fn parse(pattern: &[u8]) -> Self {
        let stars = pattern.iter().filter(|&&b| b == b'*').count();
        match (stars, pattern) {
            (0, _) => KeyPattern::Exact(Bytes::copy_from_slice(pattern)),
            (1, [b'*']) => KeyPattern::All,
            (1, [head @ .., b'*']) => KeyPattern::Prefix(Bytes::copy_from_slice(head)),
            (1, [b'*', tail @ ..]) => KeyPattern::Suffix(Bytes::copy_from_slice(tail)),
            _ => KeyPattern::Unsupported,
        }
    }

    #[inline]
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            KeyPattern::All => true,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix),
            KeyPattern::Suffix(suffix) => key.ends_with(suffix),
            KeyPattern::Exact(exact) => key == &exact[..],
            KeyPattern::Unsupported => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shapes() {
        assert_eq!(KeyPattern::parse(b"*"), KeyPattern::All);
        assert_eq!(KeyPattern::parse(b"a*"), KeyPattern::Prefix(Bytes::from("a")));
        assert_eq!(KeyPattern::parse(b"*a"), KeyPattern::Suffix(Bytes::from("a")));
        assert_eq!(KeyPattern::parse(b"abc"), KeyPattern::Exact(Bytes::from("abc")));
        assert_eq!(KeyPattern::parse(b"a*b"), KeyPattern::Unsupported);
        assert_eq!(KeyPattern::parse(b"*a*"), KeyPattern::Unsupported);
    }

    #[test]
    fn test_matching() {
        let prefix = KeyPattern::parse(b"user:*");
        assert!(prefix.matches(b"user:1"));
        assert!(prefix.matches(b"user:"));
        assert!(!prefix.matches(b"User:1"));

        let suffix = KeyPattern::parse(b"*.tmp");
        assert!(suffix.matches(b"a.tmp"));
        assert!(!suffix.matches(b"a.tmpx"));

        assert!(KeyPattern::parse(b"?").matches(b"?"));
        assert!(!KeyPattern::parse(b"?").matches(b"a"));
        assert!(!KeyPattern::parse(b"a*b").matches(b"ab"));
    }
}
