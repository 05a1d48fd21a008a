//! Statement building.
//!
//! Statements are assembled from structural text (identifiers, raw condition
//! fragments) and bound values. Values never enter the statement text: each
//! one becomes a placeholder rendered for the connection's dialect.

pub mod builder;

pub use builder::{Outcome, QueryBuilder};

use crate::config::DriverKind;
use crate::core::{DataError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid table pattern")
});
static COLUMN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*\.)?([A-Za-z_][A-Za-z0-9_]*|\*)$").expect("valid column pattern")
});

/// Placeholder style of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `@P1`, `@P2`, ...
    AtP,
}

impl Dialect {
    pub fn for_driver(driver: DriverKind) -> Self {
        match driver {
            DriverKind::RelationalSchema => Dialect::Dollar,
            DriverKind::EnterpriseSql => Dialect::AtP,
            DriverKind::RelationalTuned | DriverKind::DocumentStore | DriverKind::EmbeddedFile => {
                Dialect::Question
            }
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Question => "?".to_string(),
            Dialect::Dollar => format!("${}", index),
            Dialect::AtP => format!("@P{}", index),
        }
    }

    /// Rewrites `?` markers into this dialect's placeholders.
    ///
    /// Markers inside quoted literals (including backslash-escaped quotes),
    /// `--` line comments and `/* */` block comments are left alone.
    pub fn number_placeholders(&self, sql: &str) -> String {
        if *self == Dialect::Question {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut index = 0;
        let mut state = Scan::Code;
        let mut chars = sql.chars().peekable();
        while let Some(ch) = chars.next() {
            out.push(ch);
            state = match state {
                Scan::Quoted(q) => {
                    if ch == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                        Scan::Quoted(q)
                    } else if ch == q {
                        Scan::Code
                    } else {
                        Scan::Quoted(q)
                    }
                }
                Scan::LineComment if ch == '\n' => Scan::Code,
                Scan::LineComment => Scan::LineComment,
                Scan::BlockComment if ch == '*' && chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push('/');
                    Scan::Code
                }
                Scan::BlockComment => Scan::BlockComment,
                Scan::Code => match ch {
                    '\'' | '"' => Scan::Quoted(ch),
                    '-' if chars.peek() == Some(&'-') => Scan::LineComment,
                    '/' if chars.peek() == Some(&'*') => {
                        chars.next();
                        out.push('*');
                        Scan::BlockComment
                    }
                    '?' => {
                        out.pop();
                        index += 1;
                        out.push_str(&self.placeholder(index));
                        Scan::Code
                    }
                    _ => Scan::Code,
                },
            };
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Sort direction for ORDER BY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl FromStr for Direction {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            _ => Err(DataError::Validation(format!(
                "invalid sort direction '{}': expected ASC or DESC",
                s
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
        }
    }
}

pub(crate) fn validate_table(name: &str) -> Result<()> {
    if TABLE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(DataError::Validation(format!("invalid table name '{}'", name)))
    }
}

pub(crate) fn validate_column(name: &str) -> Result<()> {
    if COLUMN_NAME.is_match(name) {
        Ok(())
    } else {
        Err(DataError::Validation(format!("invalid column name '{}'", name)))
    }
}
