//! Orchestrator-style resource quantities.
//!
//! A quantity is a numeric coefficient followed by an optional unit
//! suffix: `"2"`, `"500m"`, `"512Mi"`, `"0.1Ti"`. Suffixes fall into two
//! families: CPU cores (`""`, `"m"`) and bytes (`"Ki"`..`"Ei"`, `"k"`..`"E"`).
//! Quantities are only comparable inside one family.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid coefficient in quantity: {0}")]
    InvalidNumber(String),

    #[error("unknown unit suffix in quantity: {0}")]
    UnknownSuffix(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitFamily {
    Cores,
    Bytes,
}

/// Outcome of checking a requested quantity against an allowed maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceComparison {
    /// The request is larger than the maximum.
    Exceeds,
    /// The request is at or below the maximum.
    Within,
    /// Different unit families, or one side failed to parse.
    Incomparable,
}

const SUFFIXES: &[(&str, f64, UnitFamily)] = &[
    ("", 1.0, UnitFamily::Cores),
    ("m", 0.001, UnitFamily::Cores),
    ("Ki", 1024.0, UnitFamily::Bytes),
    ("Mi", 1024.0 * 1024.0, UnitFamily::Bytes),
    ("Gi", 1024.0 * 1024.0 * 1024.0, UnitFamily::Bytes),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0, UnitFamily::Bytes),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0, UnitFamily::Bytes),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0, UnitFamily::Bytes),
    ("k", 1e3, UnitFamily::Bytes),
    ("M", 1e6, UnitFamily::Bytes),
    ("G", 1e9, UnitFamily::Bytes),
    ("T", 1e12, UnitFamily::Bytes),
    ("P", 1e15, UnitFamily::Bytes),
    ("E", 1e18, UnitFamily::Bytes),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    coefficient: f64,
    suffix: String,
}

impl Quantity {
    pub fn parse(s: &str) -> Result<Self, QuantityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        let split = s
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let coefficient: f64 = number
            .parse()
            .map_err(|_| QuantityError::InvalidNumber(s.to_string()))?;
        if !coefficient.is_finite() || coefficient < 0.0 {
            return Err(QuantityError::InvalidNumber(s.to_string()));
        }
        if !SUFFIXES.iter().any(|(known, _, _)| *known == suffix) {
            return Err(QuantityError::UnknownSuffix(s.to_string()));
        }

        Ok(Self {
            coefficient,
            suffix: suffix.to_string(),
        })
    }

    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn entry(&self) -> (f64, UnitFamily) {
        SUFFIXES
            .iter()
            .find(|(known, _, _)| *known == self.suffix)
            .map(|(_, factor, family)| (*factor, *family))
            .unwrap_or((1.0, UnitFamily::Cores))
    }

    pub fn family(&self) -> UnitFamily {
        self.entry().1
    }

    /// Value in base units (cores or bytes).
    pub fn base_value(&self) -> f64 {
        self.coefficient * self.entry().0
    }

    /// Multiply the coefficient, keeping the unit suffix as written.
    pub fn scale(&self, multiplier: u32) -> Self {
        Self {
            coefficient: self.coefficient * f64::from(multiplier),
            suffix: self.suffix.clone(),
        }
    }

    /// Compare two quantities of the same family.
    pub fn partial_cmp_value(&self, other: &Self) -> Option<Ordering> {
        if self.family() != other.family() {
            return None;
        }
        self.base_value().partial_cmp(&other.base_value())
    }
}

/// Decimal places kept when a coefficient is not whole.
const DISPLAY_PRECISION: usize = 3;

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = format!("{:.*}", DISPLAY_PRECISION, self.coefficient);
        let text = text.trim_end_matches('0').trim_end_matches('.');
        write!(f, "{text}{}", self.suffix)
    }
}

/// Check a user-requested quantity against an allowed maximum.
pub fn compare_resources(max: &str, requested: &str) -> ResourceComparison {
    let (Ok(max), Ok(requested)) = (Quantity::parse(max), Quantity::parse(requested)) else {
        return ResourceComparison::Incomparable;
    };
    match requested.partial_cmp_value(&max) {
        Some(Ordering::Greater) => ResourceComparison::Exceeds,
        Some(_) => ResourceComparison::Within,
        None => ResourceComparison::Incomparable,
    }
}
