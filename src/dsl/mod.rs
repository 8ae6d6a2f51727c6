//! Plan document model, parser, and layered static validation.

pub mod parser;
pub mod schema;
pub mod validation;

pub use parser::{load_plan, parse_plan, DirPlanLookup, PlanFormat, PlanLookup};
pub use schema::{
    CompareOp, Export, ForeachSpec, Guard, LoopBody, Node, NodeOutputs, NodeType, OnError, Plan,
    Policy, SubflowCall, UiConfig, WhileSpec,
};
pub use validation::{
    validate_plan, Diagnostic, DiagnosticLevel, ValidateOptions, ValidationReport,
};
