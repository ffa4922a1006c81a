//! Delete-intent statement rewriting.
//!
//! The analytical query engine is read-only over the columnar store, so a
//! bulk deletion is expressed as a read: a statement of the shape
//!
//! ```text
//! DELETE <alias> FROM <table> <alias> WHERE <predicate>
//! ```
//!
//! is rewritten to
//!
//! ```text
//! SELECT <alias>.artifact_location, <alias>.relation_id
//! FROM <table> <alias> WHERE <predicate>
//! ```
//!
//! whose result rows feed the physical deletion primitives in
//! [`crate::cascade`]. The alias is mandatory — without it the two
//! projected columns cannot be qualified unambiguously. A statement
//! missing the alias or the wrapper shape is a user-facing configuration
//! error raised before any task is created, never a runtime failure.

use crate::error::SiltError;

/// Columns the rewritten statement projects, in order.
pub const PROJECTED_COLUMNS: [&str; 2] = ["artifact_location", "relation_id"];

/// A recognized delete-intent statement, decomposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteIntent {
    pub table: String,
    pub alias: String,
    pub predicate: String,
}

impl DeleteIntent {
    /// Render the equivalent read-only selection statement.
    pub fn to_select(&self) -> String {
        format!(
            "SELECT {a}.{c0}, {a}.{c1} FROM {t} {a} WHERE {p}",
            a = self.alias,
            c0 = PROJECTED_COLUMNS[0],
            c1 = PROJECTED_COLUMNS[1],
            t = self.table,
            p = self.predicate,
        )
    }
}

/// Whether a statement is delete-intent (starts with the `DELETE` keyword).
pub fn is_delete_intent(statement: &str) -> bool {
    statement
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("delete"))
}

/// Parse a delete-intent statement into its parts.
///
/// Keywords are case-insensitive; the predicate is carried through
/// verbatim. All shape violations are [`SiltError::InvalidStatement`].
pub fn parse_delete_intent(statement: &str) -> Result<DeleteIntent, SiltError> {
    let tokens: Vec<&str> = statement.split_whitespace().collect();

    // DELETE <alias> FROM <table> <alias> WHERE <predicate...>
    if tokens.len() < 7 {
        return Err(SiltError::InvalidStatement(format!(
            "expected `DELETE <alias> FROM <table> <alias> WHERE <predicate>`, got `{}`",
            statement.trim()
        )));
    }
    if !tokens[0].eq_ignore_ascii_case("delete") {
        return Err(SiltError::InvalidStatement(
            "statement is not delete-intent".into(),
        ));
    }
    if tokens[1].eq_ignore_ascii_case("from") {
        return Err(SiltError::InvalidStatement(
            "delete-intent statement requires a table alias: \
             `DELETE <alias> FROM <table> <alias> WHERE ...`"
                .into(),
        ));
    }
    let alias = tokens[1];
    if !tokens[2].eq_ignore_ascii_case("from") {
        return Err(SiltError::InvalidStatement(format!(
            "expected FROM after alias `{alias}`"
        )));
    }
    let table = tokens[3];
    if tokens[4] != alias {
        return Err(SiltError::InvalidStatement(format!(
            "alias `{}` after table `{}` does not match deletion alias `{}`",
            tokens[4], table, alias
        )));
    }
    if !tokens[5].eq_ignore_ascii_case("where") {
        return Err(SiltError::InvalidStatement(
            "delete-intent statement requires a WHERE predicate".into(),
        ));
    }
    let predicate = tokens[6..].join(" ");

    Ok(DeleteIntent {
        table: table.to_owned(),
        alias: alias.to_owned(),
        predicate,
    })
}

/// Rewrite a delete-intent statement into its read-only equivalent.
pub fn rewrite_delete_to_select(statement: &str) -> Result<String, SiltError> {
    Ok(parse_delete_intent(statement)?.to_select())
}
