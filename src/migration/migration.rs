//! Migration descriptor produced by the parser

use std::fmt;

/// Direction of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Advances the schema
    Up,
    /// Reverts the schema
    Down,
}

impl Direction {
    /// The form stored in `migrations_history.direction`
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// Parse the filename/database form (`up` / `down`)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a migration is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// SQL statements wrapped in a synthesized transaction
    SqlTransaction,
    /// SQL statements executed sequentially outside a transaction;
    /// selected by the `-- NO_TRANSACTION` sentinel
    SqlNoTransaction,
    /// A compiled procedure resolved by name through the `Runner`
    Registered,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SqlTransaction => "sql",
            Strategy::SqlNoTransaction => "sql-no-transaction",
            Strategy::Registered => "registered",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single versioned, directional schema transformation
///
/// Produced by parsing one migration asset. For SQL strategies
/// `statements` holds the executable statements in source order; for
/// registered migrations `name` holds the procedure identifier to hand to
/// the `Runner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Positive version parsed from the leading numeric prefix of the
    /// file name
    pub version: i64,
    pub direction: Direction,
    pub strategy: Strategy,
    /// Procedure identifier for registered migrations; empty otherwise
    pub name: String,
    /// Ordered SQL statements with `BEGIN`/`COMMIT` stripped; empty for
    /// registered migrations
    pub statements: Vec<String>,
    /// The asset name this migration was parsed from
    pub file_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_round_trip() {
        assert_eq!(Direction::parse("up"), Some(Direction::Up));
        assert_eq!(Direction::parse("down"), Some(Direction::Down));
        assert_eq!(Direction::parse("sideways"), None);
        assert_eq!(Direction::Up.to_string(), "up");
        assert_eq!(Direction::Down.to_string(), "down");
    }

    #[test]
    fn test_direction_sorts_up_before_down() {
        // Listing order ties on version are broken by direction
        assert!(Direction::Up < Direction::Down);
    }
}
