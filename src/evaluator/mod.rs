//! Guard evaluation: `when` guards and `while` conditions.
//!
//! Guards come in two equivalent forms: a restricted expression string
//! (`{expr: "${a.v} > 10"}`) or a structured comparison
//! (`{left, op, right}`). Both resolve embedded placeholders against the
//! current scope before evaluation. A guard that evaluates to null is false.

pub mod coercion;
pub mod expr;

use serde_json::Value;
use thiserror::Error;

use crate::dsl::schema::Guard;
use crate::error::{BlockError, ErrorCode};
use crate::reference::{self, Reference, ResolveError, Scope};

pub use coercion::is_truthy;
pub use expr::check_syntax;

/// Guard evaluation failure modes.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("unsafe expression: {0}")]
    Unsafe(String),
    #[error("{0}")]
    Resolve(ResolveError),
    #[error("type error in guard: {0}")]
    Type(String),
}

impl EvalError {
    pub fn into_block_error(self) -> BlockError {
        match self {
            EvalError::Unsafe(msg) => BlockError::new(ErrorCode::UnsafeExpression, msg),
            EvalError::Resolve(err) => {
                BlockError::new(err.code(), err.to_string())
            }
            EvalError::Type(msg) => BlockError::new(ErrorCode::UnsafeExpression, msg),
        }
    }

    pub fn resolve_error(&self) -> Option<&ResolveError> {
        match self {
            EvalError::Resolve(err) => Some(err),
            _ => None,
        }
    }
}

/// Evaluate a guard against the scope. Falsy results (including null) skip
/// the node.
pub fn evaluate_guard(guard: &Guard, scope: &Scope<'_>) -> Result<bool, EvalError> {
    match guard {
        Guard::Expr { expr } => {
            let resolver =
                |path: &str| reference::resolve_reference(&Reference::parse(path), scope);
            let parsed = expr::parse_expr(expr, &resolver)?;
            let value = expr::evaluate(&parsed, &resolver)?;
            Ok(is_truthy(&value))
        }
        Guard::Comparison { left, op, right } => {
            let left = reference::resolve_value(left, scope).map_err(EvalError::Resolve)?;
            let right = reference::resolve_value(right, scope).map_err(EvalError::Resolve)?;
            coercion::compare(*op, &left, &right)
        }
        Guard::Literal(value) => {
            let resolved = reference::resolve_value(value, scope).map_err(EvalError::Resolve)?;
            Ok(is_truthy(&resolved))
        }
    }
}

/// Syntax-check a guard without a scope; used by the validator.
pub fn check_guard_syntax(guard: &Guard) -> Result<(), EvalError> {
    match guard {
        Guard::Expr { expr } => check_syntax(expr),
        // Structured comparisons and literals have no syntax of their own.
        Guard::Comparison { .. } | Guard::Literal(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::schema::CompareOp;
    use serde_json::json;

    fn vars_scope(vars: &serde_json::Map<String, Value>) -> Scope<'_> {
        Scope::new(vars)
    }

    #[test]
    fn test_expr_guard_with_vars() {
        let vars = json!({"n": 5}).as_object().unwrap().clone();
        let scope = vars_scope(&vars);
        let guard = Guard::Expr {
            expr: "${vars.n} > 3".into(),
        };
        assert!(evaluate_guard(&guard, &scope).unwrap());

        let guard = Guard::Expr {
            expr: "${vars.n} > 10".into(),
        };
        assert!(!evaluate_guard(&guard, &scope).unwrap());
    }

    #[test]
    fn test_comparison_guard() {
        let vars = json!({"status": "approved"}).as_object().unwrap().clone();
        let scope = vars_scope(&vars);
        let guard = Guard::Comparison {
            left: json!("${vars.status}"),
            op: CompareOp::Eq,
            right: json!("approved"),
        };
        assert!(evaluate_guard(&guard, &scope).unwrap());
    }

    #[test]
    fn test_null_guard_is_false() {
        let vars = serde_json::Map::new();
        let scope = vars_scope(&vars);
        assert!(!evaluate_guard(&Guard::Literal(Value::Null), &scope).unwrap());
        assert!(evaluate_guard(&Guard::Literal(json!(true)), &scope).unwrap());
    }

    #[test]
    fn test_unsafe_guard_rejected() {
        let vars = serde_json::Map::new();
        let scope = vars_scope(&vars);
        let guard = Guard::Expr {
            expr: "1 + 1 == 2".into(),
        };
        let err = evaluate_guard(&guard, &scope).unwrap_err();
        assert_eq!(
            err.into_block_error().code,
            ErrorCode::UnsafeExpression
        );
    }

    #[test]
    fn test_guard_syntax_check() {
        assert!(check_guard_syntax(&Guard::Expr {
            expr: "${a.v} >= 1 and ${a.v} <= 9".into()
        })
        .is_ok());
        assert!(check_guard_syntax(&Guard::Expr {
            expr: "import os".into()
        })
        .is_err());
    }
}
