//! Stage routing
//!
//! The only place that decides where a turn goes next. Both functions are
//! pure so the state machine can be tested without a model.

use crate::models::WorkflowStage;

/// Literal a research answer ends with when it needs arithmetic.
pub const TRIGGER_PHRASE: &str = "NEED_MATH_CALCULATION";

pub fn requires_calculation(output: &str) -> bool {
    output.contains(TRIGGER_PHRASE)
}

/// Next stage after `stage` produced `output`.
pub fn route(stage: WorkflowStage, output: &str) -> WorkflowStage {
    match stage {
        WorkflowStage::Research if requires_calculation(output) => WorkflowStage::Calculation,
        _ => WorkflowStage::Done,
    }
}

/// Expression written after the trigger phrase, if any.
pub fn handoff_expression(output: &str) -> Option<&str> {
    let (_, rest) = output.rsplit_once(TRIGGER_PHRASE)?;
    let expression = rest
        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
        .lines()
        .next()?
        .trim()
        .trim_matches('`');

    if expression.is_empty() {
        None
    } else {
        Some(expression)
    }
}
