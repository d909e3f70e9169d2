//! Status decoding for the generator's final output line.
//!
//! The generator prints progress freely, but its last non-empty line must be a
//! signed base-10 integer. Anything else breaks the contract and aborts the round.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signed status reported by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub i64);

/// Classification of a [`StatusCode`] by sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    /// Negative: upstream fatal error.
    Fatal,
    /// Zero: submit new work.
    Proceed,
    /// Positive: unfinished work already exists, nothing to do this round.
    Skip,
}

impl StatusCode {
    pub fn class(self) -> StatusClass {
        match self.0 {
            n if n < 0 => StatusClass::Fatal,
            0 => StatusClass::Proceed,
            _ => StatusClass::Skip,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StatusClass {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusClass::Fatal => "fatal",
            StatusClass::Proceed => "proceed",
            StatusClass::Skip => "skip",
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("process produced no output to decode a status from")]
    Empty,
    #[error("last output line is not an integer status: {line:?}")]
    NotAnInteger { line: String },
}

/// Decode the status carried by the last non-empty line of `output`.
pub fn decode_status(output: &str) -> Result<StatusCode, DecodeError> {
    let line = output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or(DecodeError::Empty)?;

    line.parse::<i64>()
        .map(StatusCode)
        .map_err(|_| DecodeError::NotAnInteger {
            line: line.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_sign() {
        assert_eq!(StatusCode(-7).class(), StatusClass::Fatal);
        assert_eq!(StatusCode(-1).class(), StatusClass::Fatal);
        assert_eq!(StatusCode(0).class(), StatusClass::Proceed);
        assert_eq!(StatusCode(1).class(), StatusClass::Skip);
        assert_eq!(StatusCode(i64::MAX).class(), StatusClass::Skip);
    }

    #[test]
    fn decodes_last_line_after_progress_output() {
        let output = "loading project\nfound 12 trajectories\n3\n";
        assert_eq!(decode_status(output), Ok(StatusCode(3)));
    }

    #[test]
    fn trailing_blank_lines_are_ignored() {
        let output = "queued tasks\n  -1  \n\n   \n";
        assert_eq!(decode_status(output), Ok(StatusCode(-1)));
    }

    #[test]
    fn accepts_explicit_plus_sign() {
        assert_eq!(decode_status("+2"), Ok(StatusCode(2)));
    }

    #[test]
    fn only_the_last_line_counts() {
        let err = decode_status("0\nTraceback (most recent call last):\n").unwrap_err();
        assert_eq!(
            err,
            DecodeError::NotAnInteger {
                line: "Traceback (most recent call last):".to_string()
            }
        );
    }

    #[test]
    fn rejects_non_decimal_forms() {
        for line in ["0x10", "1.0", "1e3", "one", "- 1"] {
            assert!(
                matches!(decode_status(line), Err(DecodeError::NotAnInteger { .. })),
                "{line} should not decode"
            );
        }
    }

    #[test]
    fn empty_output_is_an_error() {
        assert_eq!(decode_status(""), Err(DecodeError::Empty));
        assert_eq!(decode_status("\n \n"), Err(DecodeError::Empty));
    }
}
