// src/version.rs

//! Package version parsing and ordering
//!
//! Package versions are sequences of non-negative integers separated by
//! `.` or `-` (`1.2.3`, `0.4-10`, `2023.10.1`). Ordering compares the
//! components numerically, left to right, so `1.10` sorts after `1.9`.
//! A shorter version that is a prefix of a longer one sorts first.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed package version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageVersion {
    raw: String,
    components: Vec<u64>,
}

impl PackageVersion {
    /// Parse a version string
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::ParseError("empty version string".to_string()));
        }

        let components = trimmed
            .split(['.', '-'])
            .map(|part| {
                part.parse::<u64>().map_err(|e| {
                    Error::ParseError(format!("Invalid version '{}': {}", trimmed, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: trimmed.to_string(),
            components,
        })
    }

    /// The version exactly as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for PackageVersion {}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for PackageVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PackageVersion> for String {
    fn from(value: PackageVersion) -> Self {
        value.raw
    }
}

/// Comparison operator in a dependency constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl ConstraintOp {
    pub fn as_str(&self) -> &str {
        match self {
            ConstraintOp::GreaterEqual => ">=",
            ConstraintOp::Greater => ">",
            ConstraintOp::LessEqual => "<=",
            ConstraintOp::Less => "<",
            ConstraintOp::Equal => "==",
            ConstraintOp::NotEqual => "!=",
        }
    }
}

/// A version constraint such as `>= 1.2.3`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: PackageVersion,
}

impl VersionConstraint {
    /// Parse the text inside a dependency's parentheses, e.g. `>= 1.2.3`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (op, rest) = [
            (">=", ConstraintOp::GreaterEqual),
            ("<=", ConstraintOp::LessEqual),
            ("==", ConstraintOp::Equal),
            ("!=", ConstraintOp::NotEqual),
            (">", ConstraintOp::Greater),
            ("<", ConstraintOp::Less),
            ("=", ConstraintOp::Equal),
        ]
        .iter()
        .find_map(|(prefix, op)| text.strip_prefix(prefix).map(|rest| (*op, rest)))
        .ok_or_else(|| Error::ParseError(format!("Invalid version constraint '{}'", text)))?;

        Ok(Self {
            op,
            version: PackageVersion::parse(rest)?,
        })
    }

    /// Check whether a version satisfies this constraint
    pub fn matches(&self, version: &PackageVersion) -> bool {
        let ord = version.cmp(&self.version);
        match self.op {
            ConstraintOp::GreaterEqual => ord != Ordering::Less,
            ConstraintOp::Greater => ord == Ordering::Greater,
            ConstraintOp::LessEqual => ord != Ordering::Greater,
            ConstraintOp::Less => ord == Ordering::Less,
            ConstraintOp::Equal => ord == Ordering::Equal,
            ConstraintOp::NotEqual => ord != Ordering::Equal,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}
