//! SQL text helpers shared by the relational backends.

use crate::error::PhysicalError;

/// Check a table identifier before it is spliced into SQL text.
///
/// Accepts one or more `[A-Za-z0-9_]` segments joined by `.`, so both
/// `vault_kv_store` and `database.vault_kv` are valid.
pub fn validate_table(name: &str) -> Result<&str, PhysicalError> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(PhysicalError::Config(format!(
            "invalid table name: {:?}",
            name
        )));
    }
    Ok(name)
}

/// Turn a key prefix into a `LIKE` pattern matching every key under it.
/// Uses backslash as the escape character.
pub fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert!(validate_table("vault_kv_store").is_ok());
        assert!(validate_table("database.vault_kv").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("a..b").is_err());
        assert!(validate_table("kv; DROP TABLE users").is_err());
        assert!(validate_table("kv-store").is_err());
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_prefix(""), "%");
        assert_eq!(like_prefix("foo/"), "foo/%");
        assert_eq!(like_prefix("100%_done\\"), "100\\%\\_done\\\\%");
    }
}
