//! Value normalization. Every raw extraction goes through a fixed chain:
//! trim, collapse internal whitespace, then the key's optional lowercase and
//! numeric-cast steps. Cast failures fall back to the whitespace-normalized
//! string and are logged, never thrown.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::types::Normalize;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?\d[\d,]*(?:\.\d+)?").unwrap());

/// Apply the normalization chain for one key.
pub fn normalize_value(raw: &str, spec: &Normalize, key: &str) -> String {
    let mut value = collapse_whitespace(raw.trim());

    if spec.lowercase {
        value = value.to_lowercase();
    }

    if spec.numeric {
        match numeric_cast(&value) {
            Some(number) => value = number,
            None => {
                warn!(key, value = %value, "numeric cast failed, keeping string value");
            }
        }
    }

    value
}

/// Replace every run of whitespace (including newlines from block elements)
/// with a single space.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space && !out.is_empty() {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Extract the first numeric token and render it canonically. Handles
/// thousands separators and currency prefixes ("$1,299.00" becomes "1299").
fn numeric_cast(value: &str) -> Option<String> {
    let m = NUMBER_RE.find(value)?;
    let cleaned: String = m.as_str().chars().filter(|c| *c != ',').collect();
    let number: f64 = cleaned.parse().ok()?;
    if number.fract() == 0.0 && number.abs() < 1e15 {
        Some(format!("{}", number as i64))
    } else {
        Some(format!("{number}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> Normalize {
        Normalize::default()
    }

    #[test]
    fn trims_and_collapses_whitespace() {
        assert_eq!(
            normalize_value("  In \n  Stock  ", &plain(), "k"),
            "In Stock"
        );
        assert_eq!(normalize_value("\t\n ", &plain(), "k"), "");
    }

    #[test]
    fn lowercase_applies_after_collapse() {
        let spec = Normalize {
            lowercase: true,
            numeric: false,
        };
        assert_eq!(normalize_value("  Sold  OUT ", &spec, "k"), "sold out");
    }

    #[test]
    fn numeric_cast_strips_currency_and_separators() {
        let spec = Normalize {
            lowercase: false,
            numeric: true,
        };
        assert_eq!(normalize_value("$1,299.00", &spec, "price"), "1299");
        assert_eq!(normalize_value("19.99 EUR", &spec, "price"), "19.99");
        assert_eq!(normalize_value("-3 remaining", &spec, "stock"), "-3");
    }

    #[test]
    fn numeric_cast_failure_keeps_string() {
        let spec = Normalize {
            lowercase: false,
            numeric: true,
        };
        assert_eq!(normalize_value("  out of stock ", &spec, "stock"), "out of stock");
    }

    #[test]
    fn lowercase_and_numeric_compose() {
        let spec = Normalize {
            lowercase: true,
            numeric: true,
        };
        assert_eq!(normalize_value("Qty: 42", &spec, "qty"), "42");
    }
}
