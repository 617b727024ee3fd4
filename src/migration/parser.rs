//! Migration asset parsing
//!
//! Classifies an asset name into `(version, direction, strategy)` and
//! splits SQL bodies into executable statements. The statement splitter is
//! a small state machine over characters with two states: normal, and
//! inside a dollar-quoted block with a remembered tag. It is not a full
//! SQL parser; comment-embedded and string-literal semicolons are out of
//! scope.

use crate::migration::{Direction, Migration, MigrationError, Source, Strategy};
use once_cell::sync::Lazy;
use regex::Regex;

/// Sentinel comment that switches an SQL asset to the no-transaction
/// strategy (case-sensitive, anywhere in the file)
pub const NO_TRANSACTION_SENTINEL: &str = "-- NO_TRANSACTION";

/// Migration asset name grammar: `<version>_<slug>.(up|down).(sql|rs)`
static FILE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<version>\d+)_(?P<slug>[^.]+)\.(?P<dir>up|down)\.(?P<ext>sql|rs)$")
        .expect("migration file name pattern is valid")
});

/// Function headers scanned out of registered migration sources
static FN_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"fn\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("function header pattern is valid")
});

/// Parser over a migration asset source
pub struct Parser<'a> {
    source: &'a dyn Source,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a dyn Source) -> Self {
        Self { source }
    }

    /// Parse version, direction and provisional strategy from an asset name
    ///
    /// The returned descriptor has no statements yet; use [`Parser::parse`]
    /// for the full migration.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` when the name does not match the
    /// migration grammar or its version is zero or out of range.
    pub fn parse_name(&self, file_name: &str) -> Result<Migration, MigrationError> {
        let captures = FILE_NAME_RE
            .captures(file_name)
            .ok_or_else(|| MigrationError::Parse(file_name.to_string()))?;

        let version: i64 = captures["version"]
            .parse()
            .map_err(|_| MigrationError::Parse(file_name.to_string()))?;
        if version == 0 {
            return Err(MigrationError::Parse(file_name.to_string()));
        }

        // The grammar admits only "up" and "down" here
        let direction = Direction::parse(&captures["dir"])
            .ok_or_else(|| MigrationError::Parse(file_name.to_string()))?;

        let strategy = match &captures["ext"] {
            "rs" => Strategy::Registered,
            _ => Strategy::SqlTransaction,
        };

        Ok(Migration {
            version,
            direction,
            strategy,
            name: String::new(),
            statements: Vec::new(),
            file_name: file_name.to_string(),
        })
    }

    /// Parse an asset into a complete migration descriptor
    ///
    /// Reads the asset body from the source. SQL bodies are inspected for
    /// the `-- NO_TRANSACTION` sentinel and split into statements;
    /// registered bodies are scanned for the procedure name.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` for a non-matching name and
    /// `MigrationError::MissingAsset` when the source cannot provide the
    /// body.
    pub fn parse(&self, file_name: &str) -> Result<Migration, MigrationError> {
        let mut migration = self.parse_name(file_name)?;

        let bytes = self.source.asset(file_name)?;
        let body = String::from_utf8_lossy(&bytes);

        match migration.strategy {
            Strategy::Registered => {
                migration.name = scan_procedure_name(&body, migration.version);
            }
            _ => {
                if body
                    .lines()
                    .any(|line| line.contains(NO_TRANSACTION_SENTINEL))
                {
                    migration.strategy = Strategy::SqlNoTransaction;
                }

                // The sentinel line is a comment either way; drop it from
                // the statement text
                let body: String = body
                    .lines()
                    .filter(|line| line.trim() != NO_TRANSACTION_SENTINEL)
                    .collect::<Vec<_>>()
                    .join("\n");

                let mut statements = split_statements(&body);
                if migration.strategy == Strategy::SqlTransaction {
                    statements = strip_transaction_statements(statements);
                }
                migration.statements = statements;
            }
        }

        Ok(migration)
    }
}

/// Extract the procedure identifier from a registered migration source
///
/// The body is scanned for `fn` headers; the first identifier whose suffix
/// is `_<version>` wins. A missing header is not an error; the migration
/// is valid with an empty name (and will fail at run time if executed).
fn scan_procedure_name(body: &str, version: i64) -> String {
    let suffix = format!("_{version}");
    for captures in FN_HEADER_RE.captures_iter(body) {
        let ident = &captures[1];
        if ident.ends_with(&suffix) {
            return ident.to_string();
        }
    }
    String::new()
}

/// Split an SQL body into statements
///
/// A statement break is a semicolon at depth zero. Entering a
/// dollar-quoted block (`$tag$ ... $tag$`, tag may be empty) raises the
/// depth; semicolons inside it are preserved verbatim, so a
/// `CREATE FUNCTION ... $$ ... $$ LANGUAGE plpgsql` body stays one
/// statement. Leading and trailing whitespace is trimmed and empty
/// statements are discarded.
fn split_statements(body: &str) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut dollar_tag: Option<String> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match &dollar_tag {
            None => {
                if c == ';' {
                    flush_statement(&mut statements, &mut current);
                    i += 1;
                } else if c == '$' {
                    if let Some(tag) = read_dollar_tag(&chars, i) {
                        i += tag.chars().count();
                        current.push_str(&tag);
                        dollar_tag = Some(tag);
                    } else {
                        current.push(c);
                        i += 1;
                    }
                } else {
                    current.push(c);
                    i += 1;
                }
            }
            Some(tag) => {
                if c == '$' && delimiter_at(&chars, i, tag) {
                    i += tag.chars().count();
                    current.push_str(tag);
                    dollar_tag = None;
                } else {
                    current.push(c);
                    i += 1;
                }
            }
        }
    }

    flush_statement(&mut statements, &mut current);
    statements
}

fn flush_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

/// Read a `$tag$` delimiter starting at `i`, if one is present
///
/// The tag may be empty (`$$`) or an identifier (`$body$`).
fn read_dollar_tag(chars: &[char], i: usize) -> Option<String> {
    debug_assert_eq!(chars[i], '$');
    let mut j = i + 1;
    while j < chars.len() {
        let c = chars[j];
        if c == '$' {
            return Some(chars[i..=j].iter().collect());
        }
        if !c.is_ascii_alphanumeric() && c != '_' {
            return None;
        }
        j += 1;
    }
    None
}

/// Check whether the delimiter string occurs at position `i`
fn delimiter_at(chars: &[char], i: usize, delimiter: &str) -> bool {
    let delim: Vec<char> = delimiter.chars().collect();
    chars.len() - i >= delim.len() && chars[i..i + delim.len()] == delim[..]
}

/// Remove outermost `BEGIN` / `COMMIT` statements
///
/// Transactional bodies carry their own `BEGIN;`/`COMMIT;`; the executor
/// synthesizes the transaction instead.
fn strip_transaction_statements(statements: Vec<String>) -> Vec<String> {
    statements
        .into_iter()
        .filter(|s| !s.eq_ignore_ascii_case("BEGIN") && !s.eq_ignore_ascii_case("COMMIT"))
        .collect()
}
