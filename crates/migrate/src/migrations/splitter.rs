//! Statement Splitter
//!
//! Turns a unit body into the statements the engine executes. Splitting is
//! plain text splitting on `;`: a semicolon inside a string literal or a
//! dollar-quoted function body splits the statement. Migration authors must
//! keep the delimiter out of literals.

/// Marker that, as the first statement of a body, disables the transaction
/// wrapper for the rest of the unit
pub const NO_TRANSACTION_SENTINEL: &str = "NO_TRANSACTION";

/// Statement terminator
pub const STATEMENT_DELIMITER: char = ';';

/// How a unit's statements are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// All statements and the version bookkeeping commit or roll back together
    Transactional,
    /// Each statement runs on its own against the live session
    Autonomous,
}

/// Parsed statements of one unit body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementBatch {
    pub mode: ExecutionMode,
    pub statements: Vec<String>,
}

impl StatementBatch {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }
}

/// Split a unit body into executable statements.
///
/// Whole-line `--` comments are removed and fragments left empty are
/// dropped. If the first remaining fragment is exactly
/// [`NO_TRANSACTION_SENTINEL`] it is consumed and the batch is
/// [`ExecutionMode::Autonomous`].
pub fn split_statements(body: &str) -> StatementBatch {
    let mut statements: Vec<String> = body
        .split(STATEMENT_DELIMITER)
        .map(strip_line_comments)
        .filter(|statement| !statement.is_empty())
        .collect();

    let mode = match statements.first() {
        Some(first) if first == NO_TRANSACTION_SENTINEL => {
            statements.remove(0);
            ExecutionMode::Autonomous
        }
        _ => ExecutionMode::Transactional,
    };

    StatementBatch { mode, statements }
}

fn strip_line_comments(fragment: &str) -> String {
    fragment
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transactional_body() {
        let batch = split_statements(
            "CREATE TABLE foo (id int);\nINSERT INTO foo (id) VALUES (1);\n",
        );
        assert_eq!(batch.mode, ExecutionMode::Transactional);
        assert_eq!(
            batch.statements,
            vec!["CREATE TABLE foo (id int)", "INSERT INTO foo (id) VALUES (1)"]
        );
    }

    #[test]
    fn test_sentinel_switches_to_autonomous() {
        let batch = split_statements("NO_TRANSACTION;CREATE INDEX CONCURRENTLY foo_idx ON foo (id);");
        assert_eq!(batch.mode, ExecutionMode::Autonomous);
        assert_eq!(batch.statements, vec!["CREATE INDEX CONCURRENTLY foo_idx ON foo (id)"]);

        let spaced = split_statements("  NO_TRANSACTION ;\n  ALTER TYPE state ADD VALUE 'gone';");
        assert_eq!(spaced.mode, ExecutionMode::Autonomous);
        assert_eq!(spaced.len(), 1);
    }

    #[test]
    fn test_sentinel_is_case_sensitive_and_only_leading() {
        let lower = split_statements("no_transaction; CREATE TABLE foo (id int);");
        assert_eq!(lower.mode, ExecutionMode::Transactional);
        assert_eq!(lower.statements[0], "no_transaction");

        let late = split_statements("CREATE TABLE foo (id int); NO_TRANSACTION;");
        assert_eq!(late.mode, ExecutionMode::Transactional);
        assert_eq!(late.len(), 2);
    }

    #[test]
    fn test_empty_and_sentinel_only_bodies() {
        let empty = split_statements("  \n");
        assert_eq!(empty.mode, ExecutionMode::Transactional);
        assert!(empty.is_empty());

        let sentinel_only = split_statements("NO_TRANSACTION;");
        assert_eq!(sentinel_only.mode, ExecutionMode::Autonomous);
        assert!(sentinel_only.is_empty());
    }

    #[test]
    fn test_comment_only_fragments_are_dropped() {
        let batch = split_statements(
            "-- Migration: add bar\n-- Add your schema changes here\nNO_TRANSACTION;\n-- build it online\nCREATE INDEX CONCURRENTLY bar_idx ON foo (bar);\n-- trailing note\n",
        );
        assert_eq!(batch.mode, ExecutionMode::Autonomous);
        assert_eq!(batch.statements, vec!["CREATE INDEX CONCURRENTLY bar_idx ON foo (bar)"]);
    }

    #[test]
    fn test_delimiter_inside_literal_splits() {
        let batch = split_statements("INSERT INTO notes (body) VALUES ('a;b');");
        assert_eq!(batch.len(), 2);
    }
}
