//! Parses byte sizes such as `100MiB` or `2 GB` as they appear in configuration values.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSizeError {
    #[error("empty size")]
    Empty,
    #[error("size {0:?} does not start with a number")]
    MissingNumber(String),
    #[error("unknown size unit {0:?}")]
    UnknownUnit(String),
    #[error("size {0:?} does not fit into 64 bits")]
    Overflow(String),
}

/// Parses a size made of an integer and an optional decimal (`k`, `M`, ...) or binary (`Ki`,
/// `Mi`, ...) unit prefix, optionally followed by `B`.
pub fn parse_size(input: &str) -> Result<u64, ParseSizeError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParseSizeError::Empty);
    }
    let digits_end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if digits_end == 0 {
        return Err(ParseSizeError::MissingNumber(input.to_string()));
    }
    let number: u64 = input[..digits_end]
        .parse()
        .map_err(|_| ParseSizeError::Overflow(input.to_string()))?;
    let unit = input[digits_end..].trim();
    let factor = unit_factor(unit).ok_or_else(|| ParseSizeError::UnknownUnit(unit.to_string()))?;
    number
        .checked_mul(factor)
        .ok_or_else(|| ParseSizeError::Overflow(input.to_string()))
}

fn unit_factor(unit: &str) -> Option<u64> {
    let unit = unit.strip_suffix('B').unwrap_or(unit);
    let (prefix, base) = match unit.strip_suffix('i') {
        Some("") => return None,
        Some(prefix) => (prefix, 1024u64),
        None => (unit, 1000u64),
    };
    let exponent = match prefix {
        "" => 0,
        "k" | "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return None,
    };
    base.checked_pow(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_plain_numbers() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("12B"), Ok(12));
    }

    #[test]
    fn test_parses_decimal_and_binary_prefixes() {
        assert_eq!(parse_size("20k"), Ok(20_000));
        assert_eq!(parse_size("3MB"), Ok(3_000_000));
        assert_eq!(parse_size("20MiB"), Ok(20 * 1024 * 1024));
        assert_eq!(parse_size("1Gi"), Ok(1 << 30));
        assert_eq!(parse_size("2EiB"), Ok(2 << 60));
    }

    #[test]
    fn test_tolerates_whitespace() {
        assert_eq!(parse_size("  100 MiB \n"), Ok(100 * 1024 * 1024));
    }

    #[test]
    fn test_rejects_malformed_sizes() {
        assert_eq!(parse_size(" "), Err(ParseSizeError::Empty));
        assert_eq!(
            parse_size("MiB"),
            Err(ParseSizeError::MissingNumber("MiB".to_string()))
        );
        assert_eq!(
            parse_size("5 parsecs"),
            Err(ParseSizeError::UnknownUnit("parsecs".to_string()))
        );
        assert_eq!(
            parse_size("5i"),
            Err(ParseSizeError::UnknownUnit("i".to_string()))
        );
        assert_eq!(
            parse_size("16EiB"),
            Err(ParseSizeError::Overflow("16EiB".to_string()))
        );
    }
}
