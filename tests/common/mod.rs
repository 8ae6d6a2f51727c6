#![allow(dead_code)]

use std::path::Path;

use serde_json::Value;

use blockflow::{parse_plan, BlockRegistry, Plan, PlanFormat, PlanRunner};

pub fn plan(yaml: &str) -> Plan {
    parse_plan(yaml, PlanFormat::Yaml).expect("test plan parses")
}

pub fn runner(runs_dir: &Path) -> PlanRunner {
    PlanRunner::new(BlockRegistry::with_builtins()).with_runs_dir(runs_dir)
}

/// Parsed JSONL event log for a run.
pub fn read_events(runs_dir: &Path, plan_id: &str, run_id: &str) -> Vec<Value> {
    let path = runs_dir.join(plan_id).join(format!("{run_id}.jsonl"));
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
        .lines()
        .map(|line| serde_json::from_str(line).expect("every log line is valid JSON"))
        .collect()
}

pub fn events_of_type<'a>(events: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e["type"] == event_type)
        .collect()
}

/// The sequence of event types, filtered to the given set, in emission order.
pub fn event_type_sequence(events: &[Value], types: &[&str]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str())
        .filter(|t| types.contains(t))
        .map(|t| t.to_string())
        .collect()
}
