//! Identifier validation
//!
//! Table names from configuration are interpolated into bookkeeping SQL, so
//! they are held to a conservative identifier grammar before use.

use crate::config::ConfigError;

/// Characters allowed in SQL identifiers (alphanumeric, underscore)
const ALLOWED_IDENTIFIER_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

/// PostgreSQL truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL keywords that are never acceptable as bookkeeping table names
static SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "FROM", "WHERE", "JOIN", "UNION", "DROP", "CREATE",
    "ALTER", "GRANT", "REVOKE", "TRUNCATE", "TABLE", "INDEX", "USER",
];

/// Validate that an identifier is safe to interpolate into SQL
pub fn validate_identifier(field: &str, identifier: &str) -> Result<(), ConfigError> {
    let invalid = |expected: &str| ConfigError::InvalidValue {
        field: field.to_string(),
        value: identifier.to_string(),
        expected: expected.to_string(),
    };

    let first = identifier
        .chars()
        .next()
        .ok_or_else(|| invalid("a non-empty identifier"))?;

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("an identifier of at most 63 characters"));
    }

    if identifier.chars().any(|c| !ALLOWED_IDENTIFIER_CHARS.contains(c)) {
        return Err(invalid("only ASCII letters, digits and underscores"));
    }

    if first.is_ascii_digit() {
        return Err(invalid("an identifier that does not start with a digit"));
    }

    if SQL_KEYWORDS.contains(&identifier.to_uppercase().as_str()) {
        return Err(invalid("an identifier that is not a reserved SQL keyword"));
    }

    Ok(())
}
