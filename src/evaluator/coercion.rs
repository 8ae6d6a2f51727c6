//! Value truthiness and comparison semantics for guard evaluation.

use serde_json::Value;

use crate::dsl::schema::CompareOp;

use super::EvalError;

/// Guard truthiness: null, false, zero, and empty containers are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Apply a comparison operator. Equality works across all value kinds;
/// ordering requires two numbers or two strings.
pub fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        CompareOp::Lt => ordering(left, right).map(|o| o == std::cmp::Ordering::Less),
        CompareOp::Lte => ordering(left, right).map(|o| o != std::cmp::Ordering::Greater),
        CompareOp::Gt => ordering(left, right).map(|o| o == std::cmp::Ordering::Greater),
        CompareOp::Gte => ordering(left, right).map(|o| o != std::cmp::Ordering::Less),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        // 1 == 1.0 holds, matching the numeric comparison semantics below.
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (x, y) = (a.as_f64(), b.as_f64());
            match (x, y) {
                (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| {
                    EvalError::Type("NaN is not orderable in guard expressions".into())
                }),
                _ => Err(EvalError::Type("number out of comparable range".into())),
            }
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (l, r) => Err(EvalError::Type(format!(
            "cannot order {} against {}",
            kind(l),
            kind(r)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
    }

    #[test]
    fn test_numeric_compare_mixes_int_float() {
        assert!(compare(CompareOp::Eq, &json!(1), &json!(1.0)).unwrap());
        assert!(compare(CompareOp::Lt, &json!(1), &json!(1.5)).unwrap());
        assert!(compare(CompareOp::Gte, &json!(2.0), &json!(2)).unwrap());
    }

    #[test]
    fn test_string_ordering() {
        assert!(compare(CompareOp::Lt, &json!("abc"), &json!("abd")).unwrap());
    }

    #[test]
    fn test_mixed_equality_is_false() {
        assert!(!compare(CompareOp::Eq, &json!(1), &json!("1")).unwrap());
        assert!(compare(CompareOp::Ne, &json!(true), &json!(1)).unwrap());
    }

    #[test]
    fn test_mixed_ordering_errors() {
        assert!(compare(CompareOp::Lt, &json!("a"), &json!(1)).is_err());
        assert!(compare(CompareOp::Gt, &json!([1]), &json!([2])).is_err());
    }

    #[test]
    fn test_deep_equality() {
        assert!(compare(CompareOp::Eq, &json!({"a": [1]}), &json!({"a": [1]})).unwrap());
    }
}
