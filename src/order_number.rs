//! Order numbers
//!
//! Order numbers are decimal strings protected by a Luhn check digit.

use std::fmt;
use std::str::FromStr;

/// Longest accepted number; keeps the queue key and URLs bounded
pub const MAX_DIGITS: usize = 32;

/// A validated order number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Validate `raw` (surrounding whitespace ignored).
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        let digits = raw.trim();

        if digits.is_empty() {
            return Err("order number is empty");
        }
        if digits.len() > MAX_DIGITS {
            return Err("order number is too long");
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err("order number must contain digits only");
        }
        if !luhn_valid(digits) {
            return Err("order number fails the Luhn checksum");
        }

        Ok(Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Luhn mod-10 check over ASCII digits (rightmost digit is the check digit)
pub fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, b) in digits.bytes().rev().enumerate() {
        if !b.is_ascii_digit() {
            return false;
        }
        let mut d = u32::from(b - b'0');
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderNumber {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderNumber::parse(s)
    }
}

impl AsRef<str> for OrderNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_numbers() {
        for n in ["79927398713", "12345678903", "4561261212345467", "0"] {
            assert!(OrderNumber::parse(n).is_ok(), "{} should be valid", n);
        }
    }

    #[test]
    fn test_bad_checksum() {
        assert_eq!(
            OrderNumber::parse("79927398710"),
            Err("order number fails the Luhn checksum")
        );
        assert!(OrderNumber::parse("12345678901").is_err());
    }

    #[test]
    fn test_rejects_non_digits() {
        assert_eq!(
            OrderNumber::parse("7992-7398713"),
            Err("order number must contain digits only")
        );
        assert!(OrderNumber::parse("abc").is_err());
        assert!(OrderNumber::parse("").is_err());
        assert!(OrderNumber::parse("   ").is_err());
    }

    #[test]
    fn test_rejects_overlong_input() {
        let long = "0".repeat(MAX_DIGITS + 1);
        assert_eq!(OrderNumber::parse(&long), Err("order number is too long"));
    }

    #[test]
    fn test_trims_whitespace() {
        let number = OrderNumber::parse(" 79927398713\n").unwrap();
        assert_eq!(number.as_str(), "79927398713");
        assert_eq!(number.to_string(), "79927398713");
    }
}
