//! Validation diagnostic types.

use serde::{Deserialize, Serialize};

/// Severity level of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &str, message: impl Into<String>, node_id: Option<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Error,
            code: code.to_string(),
            message: message.into(),
            node_id,
            field: None,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>, node_id: Option<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Warning,
            code: code.to_string(),
            message: message.into(),
            node_id,
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Aggregated result of plan validation. Validation never stops at the first
/// finding; the full set is reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let is_valid = !diagnostics
            .iter()
            .any(|d| d.level == DiagnosticLevel::Error);
        ValidationReport {
            is_valid,
            diagnostics,
        }
    }

    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Warning)
            .collect()
    }

    /// Human-readable error messages, the host-facing `[]message` surface.
    pub fn messages(&self) -> Vec<String> {
        self.errors()
            .iter()
            .map(|d| match &d.node_id {
                Some(node_id) => format!("Node {}: {}", node_id, d.message),
                None => d.message.clone(),
            })
            .collect()
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for diag in &self.diagnostics {
            let level = match diag.level {
                DiagnosticLevel::Error => "error",
                DiagnosticLevel::Warning => "warning",
            };
            match &diag.node_id {
                Some(node_id) => {
                    writeln!(f, "{level}[{}] {}: {}", diag.code, node_id, diag.message)?
                }
                None => writeln!(f, "{level}[{}] {}", diag.code, diag.message)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_validity() {
        let report = ValidationReport::from_diagnostics(vec![Diagnostic::warning(
            "W301",
            "suspicious",
            None,
        )]);
        assert!(report.is_valid);
        assert_eq!(report.warnings().len(), 1);

        let report = ValidationReport::from_diagnostics(vec![
            Diagnostic::error("E101", "broken", Some("n1".into())),
            Diagnostic::warning("W301", "meh", None),
        ]);
        assert!(!report.is_valid);
        assert_eq!(report.errors().len(), 1);
        assert_eq!(report.messages(), vec!["Node n1: broken".to_string()]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let report = ValidationReport::from_diagnostics(vec![Diagnostic::error(
            "E102",
            "cycle",
            None,
        )
        .with_field("graph")]);
        let json = serde_json::to_string(&report).unwrap();
        let back: ValidationReport = serde_json::from_str(&json).unwrap();
        assert!(!back.is_valid);
        assert_eq!(back.diagnostics[0].field.as_deref(), Some("graph"));
    }
}
