//! Comparison operator evaluation.
//!
//! One pure function per decision: [`Operator::evaluate`] compares two
//! resolved JSON values. Policy authors write `@`-prefixed operators; the
//! store speaks `$`-prefixed ones. Both spellings (and the bare name) parse
//! to the same [`Operator`].
//!
//! Null semantics are fail-closed: if either operand is null/unresolved the
//! leaf fails, except `eq` between two nulls which passes.

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::Value;

use crate::error::ResolveError;

/// A single comparison operator between two resolved values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Left value is a member of the right-hand array.
    In,
    /// Left value is not a member of the right-hand array.
    Nin,
    /// Left string matches the right-hand regex pattern.
    Regex,
    DateEq,
    DateGt,
    DateGte,
    DateLt,
    DateLte,
}

impl Operator {
    /// Parse an operator key, accepting `@eq`, `$eq`, or `eq` spellings.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownOperator`] for unrecognized names.
    pub fn parse(key: &str) -> Result<Self, ResolveError> {
        let name = key
            .strip_prefix('@')
            .or_else(|| key.strip_prefix('$'))
            .unwrap_or(key);
        match name {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "in" => Ok(Self::In),
            "nin" => Ok(Self::Nin),
            "regex" => Ok(Self::Regex),
            "dateEq" | "date_eq" => Ok(Self::DateEq),
            "dateGt" | "date_gt" => Ok(Self::DateGt),
            "dateGte" | "date_gte" => Ok(Self::DateGte),
            "dateLt" | "date_lt" => Ok(Self::DateLt),
            "dateLte" | "date_lte" => Ok(Self::DateLte),
            other => Err(ResolveError::UnknownOperator(other.to_owned())),
        }
    }

    /// Returns `true` if `key` is an operator spelling (with either prefix).
    #[must_use]
    pub fn is_operator_key(key: &str) -> bool {
        (key.starts_with('@') || key.starts_with('$')) && Self::parse(key).is_ok()
    }

    /// The store-native (`$`-prefixed) spelling of this operator.
    ///
    /// Date variants compare instants; on the wire they use the plain
    /// comparison spelling, since the store has no separate date operators.
    #[must_use]
    pub fn native(&self) -> &'static str {
        match self {
            Self::Eq | Self::DateEq => "$eq",
            Self::Ne => "$ne",
            Self::Gt | Self::DateGt => "$gt",
            Self::Gte | Self::DateGte => "$gte",
            Self::Lt | Self::DateLt => "$lt",
            Self::Lte | Self::DateLte => "$lte",
            Self::In => "$in",
            Self::Nin => "$nin",
            Self::Regex => "$regex",
        }
    }

    /// Returns `true` when the right-hand side is an array of alternatives.
    #[must_use]
    pub fn is_set_operator(&self) -> bool {
        matches!(self, Self::In | Self::Nin)
    }

    /// Evaluate this operator between two resolved values.
    ///
    /// Fail-closed on nulls: any null operand fails the comparison, except
    /// `eq(null, null)` which passes.
    #[must_use]
    pub fn evaluate(&self, left: &Value, right: &Value) -> bool {
        if left.is_null() || right.is_null() {
            return matches!(self, Self::Eq) && left.is_null() && right.is_null();
        }
        match self {
            Self::Eq => values_equal(left, right),
            Self::Ne => !values_equal(left, right),
            Self::Gt => compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Greater),
            Self::Gte => compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Less),
            Self::Lt => compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Less),
            Self::Lte => compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Greater),
            Self::In => member_of(left, right),
            Self::Nin => !member_of(left, right),
            Self::Regex => regex_match(left, right),
            Self::DateEq => date_compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Equal),
            Self::DateGt => {
                date_compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Greater)
            }
            Self::DateGte => date_compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Less),
            Self::DateLt => date_compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Less),
            Self::DateLte => {
                date_compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Greater)
            }
        }
    }
}

/// Deep equality with numeric coercion (`1` equals `1.0`).
#[must_use]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => left == right,
    }
}

/// Ordering between two values: numeric if both are numbers, lexicographic if
/// both are strings, otherwise incomparable.
fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

/// Set membership: is `left` (or, for an array left, any of its elements)
/// contained in the right-hand array?
fn member_of(left: &Value, right: &Value) -> bool {
    let Some(candidates) = right.as_array() else {
        return false;
    };
    match left.as_array() {
        Some(elements) => elements
            .iter()
            .any(|e| candidates.iter().any(|c| values_equal(e, c))),
        None => candidates.iter().any(|c| values_equal(left, c)),
    }
}

/// Regex match; an invalid pattern or non-string operand fails the leaf.
fn regex_match(left: &Value, right: &Value) -> bool {
    let (Some(subject), Some(pattern)) = (left.as_str(), right.as_str()) else {
        return false;
    };
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(subject),
        Err(err) => {
            tracing::warn!(pattern, error = %err, "invalid regex operand, leaf fails");
            false
        }
    }
}

/// Parse an instant from an RFC 3339 string or an epoch-milliseconds number.
#[must_use]
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        // Time-of-day only ("HH:MM" / "HH:MM:SS") anchored to today.
        if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        {
            return Utc::now().date_naive().and_time(t).and_utc().into();
        }
        return None;
    }
    value.as_i64().and_then(DateTime::from_timestamp_millis)
}

fn date_compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    let a = parse_instant(left)?;
    let b = parse_instant(right)?;
    Some(a.cmp(&b))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_all_prefixes() {
        assert_eq!(Operator::parse("@eq").unwrap(), Operator::Eq);
        assert_eq!(Operator::parse("$eq").unwrap(), Operator::Eq);
        assert_eq!(Operator::parse("eq").unwrap(), Operator::Eq);
        assert!(Operator::parse("@frobnicate").is_err());
    }

    #[test]
    fn eq_with_numeric_coercion() {
        assert!(Operator::Eq.evaluate(&json!(1), &json!(1.0)));
        assert!(Operator::Eq.evaluate(&json!("a"), &json!("a")));
        assert!(!Operator::Eq.evaluate(&json!("a"), &json!("b")));
    }

    #[test]
    fn null_operands_fail_except_eq_null_null() {
        assert!(Operator::Eq.evaluate(&Value::Null, &Value::Null));
        assert!(!Operator::Ne.evaluate(&Value::Null, &Value::Null));
        assert!(!Operator::Eq.evaluate(&json!(1), &Value::Null));
        assert!(!Operator::Gt.evaluate(&Value::Null, &json!(1)));
    }

    #[test]
    fn ordering_operators() {
        assert!(Operator::Gt.evaluate(&json!(20), &json!(18)));
        assert!(!Operator::Gt.evaluate(&json!(10), &json!(18)));
        assert!(Operator::Gte.evaluate(&json!(18), &json!(18)));
        assert!(Operator::Lt.evaluate(&json!("abc"), &json!("abd")));
        // Incomparable types fail, never pass
        assert!(!Operator::Lt.evaluate(&json!("abc"), &json!(5)));
    }

    #[test]
    fn set_membership() {
        assert!(Operator::In.evaluate(&json!("a"), &json!(["a", "b"])));
        assert!(!Operator::In.evaluate(&json!("c"), &json!(["a", "b"])));
        assert!(Operator::Nin.evaluate(&json!("c"), &json!(["a", "b"])));
        // array-valued left matches if any element is a member
        assert!(Operator::In.evaluate(&json!(["x", "b"]), &json!(["a", "b"])));
    }

    #[test]
    fn in_requires_array_rhs() {
        assert!(!Operator::In.evaluate(&json!("a"), &json!("a")));
    }

    #[test]
    fn regex_operator() {
        assert!(Operator::Regex.evaluate(&json!("admin@corp.io"), &json!("@corp\\.io$")));
        assert!(!Operator::Regex.evaluate(&json!("admin@other.io"), &json!("@corp\\.io$")));
        // invalid pattern fails the leaf
        assert!(!Operator::Regex.evaluate(&json!("x"), &json!("(")));
    }

    #[test]
    fn date_operators() {
        let earlier = json!("2026-01-01T00:00:00Z");
        let later = json!("2026-06-01T00:00:00Z");
        assert!(Operator::DateGt.evaluate(&later, &earlier));
        assert!(Operator::DateLt.evaluate(&earlier, &later));
        assert!(Operator::DateEq.evaluate(&earlier, &earlier));
        // epoch millis on one side
        let millis = json!(1_767_225_600_000_i64); // 2026-01-01T00:00:00Z
        assert!(Operator::DateEq.evaluate(&earlier, &millis));
    }

    #[test]
    fn native_spellings() {
        assert_eq!(Operator::Eq.native(), "$eq");
        assert_eq!(Operator::DateGt.native(), "$gt");
        assert_eq!(Operator::Nin.native(), "$nin");
    }
}
