//! `${NAME}` / `$NAME` expansion from the process environment.

/// Expands environment-variable references in a string value.
///
/// Supports `${NAME}` and bare `$NAME` (NAME = ASCII alphanumerics and `_`,
/// not starting with a digit). Unset variables expand to the empty string so
/// a missing key never leaks the literal reference into a credential field.
pub fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed && is_valid_name(&name) {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    // Malformed reference: keep the literal text.
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
            Some((_, c2)) if c2.is_ascii_alphabetic() || *c2 == '_' => {
                let mut name = String::new();
                while let Some((_, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || *c2 == '_' {
                        name.push(*c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_braced_reference() {
        std::env::set_var("WEFT_ENV_A", "alpha");
        assert_eq!(expand_env("${WEFT_ENV_A}"), "alpha");
        assert_eq!(expand_env("pre-${WEFT_ENV_A}-post"), "pre-alpha-post");
    }

    #[test]
    fn expands_bare_reference() {
        std::env::set_var("WEFT_ENV_B", "beta");
        assert_eq!(expand_env("$WEFT_ENV_B"), "beta");
        assert_eq!(expand_env("$WEFT_ENV_B/suffix"), "beta/suffix");
    }

    #[test]
    fn unset_variable_expands_to_empty() {
        std::env::remove_var("WEFT_ENV_UNSET");
        assert_eq!(expand_env("${WEFT_ENV_UNSET}"), "");
    }

    #[test]
    fn literal_text_passes_through() {
        assert_eq!(expand_env("no refs here"), "no refs here");
        assert_eq!(expand_env("price: $5"), "price: $5");
        assert_eq!(expand_env("trailing $"), "trailing $");
    }
}
