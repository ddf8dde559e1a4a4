//! Attribute recognition for claims that arrive without an explicit
//! attribute/value pair.
//!
//! Values are normalized so that `"~150 employees"` and `"150 staff"` compare
//! equal while `"150"` and `"200"` do not.

use std::sync::LazyLock;

use regex::Regex;

use compintel_shared::normalize_text;

pub const EMPLOYEE_COUNT: &str = "employee_count";
pub const FOUNDED_YEAR: &str = "founded_year";
pub const REVENUE: &str = "revenue";
pub const HEADQUARTERS: &str = "headquarters";
pub const CUSTOMER_COUNT: &str = "customer_count";

static EMPLOYEES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:employs\s+(?:about\s+|around\s+|over\s+|~)?(\d[\d,]*)|(\d[\d,]*)\+?\s*(?:full[- ]time\s+)?(?:employees|staff|people|team members|workers))",
    )
    .expect("valid regex")
});

static FOUNDED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:founded|established|incorporated|since)\s+(?:in\s+)?((?:18|19|20)\d{2})")
        .expect("valid regex")
});

static REVENUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:revenue|sales|arr)\D{0,30}?\$\s*(\d[\d,]*(?:\.\d+)?)\s*(billion|million|thousand|bn|mm|b|m|k)?\b",
    )
    .expect("valid regex")
});

static HQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[Hh]eadquartered|[Bb]ased|HQ)\s+(?:in|at|:)\s+([A-Z][A-Za-z .'-]*[A-Za-z])")
        .expect("valid regex")
});

static CUSTOMERS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d[\d,]*)\+?\s*(?:customers|clients|accounts)").expect("valid regex")
});

/// Regex-based attribute recognizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeExtractor;

impl AttributeExtractor {
    /// Recognize the first known attribute asserted by `text`.
    pub fn extract(&self, text: &str) -> Option<(String, String)> {
        if let Some(caps) = EMPLOYEES_RE.captures(text) {
            let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
            return Some((EMPLOYEE_COUNT.into(), strip_separators(raw)));
        }
        if let Some(caps) = FOUNDED_RE.captures(text) {
            return Some((FOUNDED_YEAR.into(), caps[1].to_string()));
        }
        if let Some(caps) = REVENUE_RE.captures(text) {
            let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            return scaled_amount(&caps[1], unit).map(|v| (REVENUE.into(), v));
        }
        if let Some(caps) = CUSTOMERS_RE.captures(text) {
            return Some((CUSTOMER_COUNT.into(), strip_separators(&caps[1])));
        }
        if let Some(caps) = HQ_RE.captures(text) {
            return Some((HEADQUARTERS.into(), normalize_text(&caps[1])));
        }
        None
    }
}

/// Canonical form of a value for comparison under `attribute`.
///
/// Numeric attributes compare by their leading number (revenue in whole
/// dollars); everything else compares by normalized text.
pub fn normalize_value(attribute: &str, value: &str) -> String {
    match attribute {
        EMPLOYEE_COUNT | CUSTOMER_COUNT | FOUNDED_YEAR => leading_number(value)
            .map(|n| strip_separators(&n))
            .unwrap_or_else(|| normalize_text(value)),
        REVENUE => {
            static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
                Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(billion|million|thousand|bn|mm|b|m|k)?\b")
                    .expect("valid regex")
            });
            AMOUNT_RE
                .captures(value)
                .and_then(|caps| {
                    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                    scaled_amount(&caps[1], unit)
                })
                .unwrap_or_else(|| normalize_text(value))
        }
        _ => normalize_text(value),
    }
}

fn leading_number(value: &str) -> Option<String> {
    static NUM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d[\d,]*").expect("valid regex"));
    NUM_RE.find(value).map(|m| m.as_str().to_string())
}

fn strip_separators(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn scaled_amount(number: &str, unit: &str) -> Option<String> {
    let base: f64 = number.replace(',', "").parse().ok()?;
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "billion" | "bn" | "b" => 1e9,
        "million" | "mm" | "m" => 1e6,
        "thousand" | "k" => 1e3,
        _ => 1.0,
    };
    Some(format!("{:.0}", base * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> Option<(String, String)> {
        AttributeExtractor.extract(text)
    }

    #[test]
    fn employee_counts() {
        assert_eq!(extract("~150 employees"), Some((EMPLOYEE_COUNT.into(), "150".into())));
        assert_eq!(
            extract("EFM Logistics employs about 1,200 people"),
            Some((EMPLOYEE_COUNT.into(), "1200".into()))
        );
        assert_eq!(extract("200+ staff across 3 sites"), Some((EMPLOYEE_COUNT.into(), "200".into())));
    }

    #[test]
    fn founding_year_and_headquarters() {
        assert_eq!(extract("Founded in 1998 by two brothers"), Some((FOUNDED_YEAR.into(), "1998".into())));
        assert_eq!(
            extract("Headquartered in Dallas, Texas"),
            Some((HEADQUARTERS.into(), "dallas".into()))
        );
    }

    #[test]
    fn revenue_is_scaled() {
        assert_eq!(
            extract("Annual revenue of roughly $12M"),
            Some((REVENUE.into(), "12000000".into()))
        );
        assert_eq!(
            extract("revenue: $1.5 billion"),
            Some((REVENUE.into(), "1500000000".into()))
        );
    }

    #[test]
    fn customer_counts() {
        assert_eq!(extract("Serves 500+ customers"), Some((CUSTOMER_COUNT.into(), "500".into())));
    }

    #[test]
    fn unrecognized_text_has_no_attribute() {
        assert_eq!(extract("Uses Salesforce for CRM"), None);
    }

    #[test]
    fn values_normalize_for_comparison() {
        assert_eq!(normalize_value(EMPLOYEE_COUNT, "~150 employees"), "150");
        assert_eq!(normalize_value(EMPLOYEE_COUNT, "1,200"), "1200");
        assert_eq!(normalize_value(REVENUE, "$12 million"), normalize_value(REVENUE, "12M"));
        assert_eq!(normalize_value(HEADQUARTERS, "Dallas, TX"), "dallas tx");
    }
}
