//! Minimal `.env` parser: key-value map only, no process-environment writes
//! (precedence is applied in `load_and_apply`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `.env` location: `override_dir` when given, else the current directory.
fn env_file_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

/// Parses `KEY=VALUE` lines.
///
/// - Blank lines and lines starting with `#` are skipped; a `#` inside a
///   value is kept.
/// - Keys and values are trimmed; `KEY=` and `KEY=""` yield the empty string.
/// - Double-quoted values support the `\"` escape; single quotes are
///   stripped without escapes. No multiline values.
fn parse(content: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Loads `.env` into a map. A missing file is an empty map, not an error.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<BTreeMap<String, String>> {
    let Some(path) = env_file_path(override_dir) else {
        return Ok(BTreeMap::new());
    };
    let content = std::fs::read_to_string(&path)?;
    Ok(parse(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_pairs() {
        let map = parse("FOO=bar\nBAZ=quux\n");
        assert_eq!(map.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(map.get("BAZ").map(String::as_str), Some("quux"));
    }

    #[test]
    fn skips_comments_blanks_and_malformed_lines() {
        let map = parse("\n# comment\nKEY=val\n  \nNOT_A_PAIR\n=only_value\n");
        assert_eq!(map.get("KEY").map(String::as_str), Some("val"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn strips_quotes() {
        let map = parse("A=\"hello world\"\nB='single quoted'\n");
        assert_eq!(map.get("A").map(String::as_str), Some("hello world"));
        assert_eq!(map.get("B").map(String::as_str), Some("single quoted"));
    }

    #[test]
    fn escaped_quote_inside_double_quotes() {
        let map = parse(r#"KEY="say \"hi\"""#);
        assert_eq!(map.get("KEY").map(String::as_str), Some("say \"hi\""));
    }

    #[test]
    fn empty_values_are_kept() {
        let map = parse("A=\nB=\"\"\nC=x\n");
        assert_eq!(map.get("A").map(String::as_str), Some(""));
        assert_eq!(map.get("B").map(String::as_str), Some(""));
        assert_eq!(map.get("C").map(String::as_str), Some("x"));
    }

    #[test]
    fn hash_inside_value_is_kept() {
        let map = parse("URL=http://host/#anchor\n");
        assert_eq!(
            map.get("URL").map(String::as_str),
            Some("http://host/#anchor")
        );
    }

    #[test]
    fn missing_file_is_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let map = load_env_map(Some(dir.path())).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn reads_env_file_from_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=1\nB=2\n").unwrap();
        let map = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(map.get("A").map(String::as_str), Some("1"));
        assert_eq!(map.get("B").map(String::as_str), Some("2"));
    }
}
