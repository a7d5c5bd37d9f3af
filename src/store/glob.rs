//! Glob patterns as used by KEYS and PSUBSCRIBE

use regex::Regex;

/// Convert a glob pattern to an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
  let mut regex_str = String::with_capacity(pattern.len() * 2 + 6);
  regex_str.push_str("(?s)^");

  let mut buf = [0u8; 4];
  for c in pattern.chars() {
    match c {
      '*' => regex_str.push_str(".*"),
      '?' => regex_str.push('.'),
      _ => regex_str.push_str(&regex::escape(c.encode_utf8(&mut buf))),
    }
  }

  regex_str.push('$');
  Regex::new(&regex_str)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_glob_to_regex_escapes_literals() {
    let re = glob_to_regex("a.b(c)*").unwrap();
    assert!(re.is_match("a.b(c)"));
    assert!(re.is_match("a.b(c)tail"));
    assert!(!re.is_match("aXb(c)"));

    let re = glob_to_regex("users:*").unwrap();
    assert!(re.is_match("users:1"));
    assert!(re.is_match("users:multi\nline"));
    assert!(!re.is_match("xusers:1"));
  }

  #[test]
  fn test_glob_to_regex_wildcards() {
    let re = glob_to_regex("__keyspace@0__:users:*").unwrap();
    assert!(re.is_match("__keyspace@0__:users:42"));
    assert!(!re.is_match("__keyspace@0__:orders:1"));

    let re = glob_to_regex("f?o").unwrap();
    assert!(re.is_match("foo"));
    assert!(!re.is_match("fooo"));
    assert!(glob_to_regex("*").unwrap().is_match(""));
  }
}
