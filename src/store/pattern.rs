//! Keyspace notification channels and Redis-style glob matching.

const KEYSPACE_PREFIX: &str = "__keyspace@";
const KEYSPACE_SEPARATOR: &str = "__:";

/// Channel name a keyspace notification for `key` is published on.
pub fn keyspace_channel(db: u32, key: &str) -> String {
    format!("{KEYSPACE_PREFIX}{db}{KEYSPACE_SEPARATOR}{key}")
}

/// Subscription pattern matching keyspace notifications for `key` in any database.
pub fn keyspace_pattern(key: &str) -> String {
    format!("{KEYSPACE_PREFIX}*{KEYSPACE_SEPARATOR}{}", escape_glob(key))
}

/// Extract the key from a keyspace notification channel name.
pub fn key_from_channel(channel: &str) -> Option<&str> {
    let rest = channel.strip_prefix(KEYSPACE_PREFIX)?;
    let (db, key) = rest.split_once(KEYSPACE_SEPARATOR)?;
    if db.is_empty() || !db.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(key)
}

/// Escape glob metacharacters so `input` only matches itself.
pub fn escape_glob(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Match `subject` against a Redis `PSUBSCRIBE` glob.
///
/// Supports `*`, `?`, `[...]` classes (with `^` negation and `a-z` ranges)
/// and backslash escapes. An unterminated `[` is matched literally.
pub fn glob_match(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let subject: Vec<char> = subject.chars().collect();
    matches_at(&pattern, &subject)
}

fn matches_at(pattern: &[char], subject: &[char]) -> bool {
    match pattern.split_first() {
        None => subject.is_empty(),
        Some(('*', rest)) => {
            let rest = skip_stars(rest);
            if rest.is_empty() {
                return true;
            }
            (0..=subject.len()).any(|start| matches_at(rest, &subject[start..]))
        }
        Some(('?', rest)) => !subject.is_empty() && matches_at(rest, &subject[1..]),
        Some(('[', rest)) => match parse_class(rest) {
            Some((class, after)) => subject
                .first()
                .is_some_and(|ch| class.contains(*ch) && matches_at(after, &subject[1..])),
            None => subject.first() == Some(&'[') && matches_at(rest, &subject[1..]),
        },
        Some(('\\', rest)) if !rest.is_empty() => {
            subject.first() == Some(&rest[0]) && matches_at(&rest[1..], &subject[1..])
        }
        Some((literal, rest)) => {
            subject.first() == Some(literal) && matches_at(rest, &subject[1..])
        }
    }
}

fn skip_stars(pattern: &[char]) -> &[char] {
    let count = pattern.iter().take_while(|ch| **ch == '*').count();
    &pattern[count..]
}

struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn contains(&self, ch: char) -> bool {
        let hit = self.ranges.iter().any(|(lo, hi)| *lo <= ch && ch <= *hi);
        hit != self.negated
    }
}

fn parse_class(pattern: &[char]) -> Option<(CharClass, &[char])> {
    let negated = pattern.first() == Some(&'^');
    let mut idx = usize::from(negated);
    let mut ranges = Vec::new();

    while idx < pattern.len() {
        match pattern[idx] {
            ']' => return Some((CharClass { negated, ranges }, &pattern[idx + 1..])),
            '\\' if idx + 1 < pattern.len() => {
                ranges.push((pattern[idx + 1], pattern[idx + 1]));
                idx += 2;
            }
            start if idx + 2 < pattern.len() && pattern[idx + 1] == '-' && pattern[idx + 2] != ']' => {
                let end = pattern[idx + 2];
                ranges.push((start.min(end), start.max(end)));
                idx += 3;
            }
            single => {
                ranges.push((single, single));
                idx += 1;
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pattern_matches_any_database() {
        let pattern = keyspace_pattern("example.com");
        assert_eq!(pattern, "__keyspace@*__:example.com");
        assert!(glob_match(&pattern, &keyspace_channel(0, "example.com")));
        assert!(glob_match(&pattern, &keyspace_channel(15, "example.com")));
        assert!(!glob_match(&pattern, &keyspace_channel(0, "other.com")));
        assert!(!glob_match(&pattern, &keyspace_channel(0, "example.com.evil")));
    }

    #[test]
    fn wildcard_keys_are_escaped() {
        let pattern = keyspace_pattern("*.example.com");
        assert!(glob_match(&pattern, &keyspace_channel(0, "*.example.com")));
        assert!(!glob_match(&pattern, &keyspace_channel(0, "www.example.com")));
    }

    #[test]
    fn question_mark_and_classes() {
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("key[0-9]", "key7"));
        assert!(!glob_match("key[0-9]", "keyx"));
    }

    #[test]
    fn unterminated_class_is_literal() {
        assert!(glob_match("a[b", "a[b"));
        assert!(!glob_match("a[b", "ab"));
    }

    #[test]
    fn stars_match_empty_and_long_runs() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a**b", "ab"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn extracts_key_from_channel() {
        assert_eq!(
            key_from_channel("__keyspace@0__:example.com"),
            Some("example.com")
        );
        assert_eq!(key_from_channel("__keyspace@__:example.com"), None);
        assert_eq!(key_from_channel("__keyevent@0__:expired"), None);
    }
}
