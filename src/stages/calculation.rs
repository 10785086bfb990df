//! Calculation stage
//!
//! Gives the model a single `calculator` tool backed by the restricted
//! evaluator and runs the tool loop until the model answers in prose.

use super::{current_research_output, to_chat_history, Stage, StageOutput};
use crate::calculator::{self, CalcError};
use crate::error::OrchestrationError;
use crate::llm::{ChatMessage, ChatModel, ChatRequest, ToolCall, ToolSpec};
use crate::models::{CalculationResult, WorkflowStage};
use crate::session::ConversationMessage;
use crate::workflow::routing::handoff_expression;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Upper bound on model round-trips inside one calculation
pub const MAX_TOOL_ROUNDS: usize = 5;

pub const CALCULATOR_TOOL: &str = "calculator";

const SYSTEM_PROMPT: &str = "You are a math expert with access to a calculator tool. \
Use the calculator tool for every calculation, expression or computation. \
It handles arithmetic, common math functions and nested expressions. \
Never do math in your head. After the tool returns, state the final result \
clearly, for example: The answer is 14.1%.";

pub struct CalculationStage {
    model: Arc<dyn ChatModel>,
}

impl CalculationStage {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

pub fn calculator_tool() -> ToolSpec {
    ToolSpec {
        name: CALCULATOR_TOOL.to_string(),
        description: "Evaluate an arithmetic expression and return the numeric result. \
Supports + - * / **, parentheses, and abs, round, min, max, sum, sqrt, log, log10, exp, pow, \
floor, ceil and trigonometric functions."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Arithmetic expression, e.g. ((206588 - 181001) / 181001) * 100"
                }
            },
            "required": ["expression"]
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CalculatorArgs {
    expression: String,
}

/// Execute one tool call from the model.
fn run_tool_call(call: &ToolCall) -> CalculationResult {
    if call.name != CALCULATOR_TOOL {
        return CalculationResult::from_outcome(
            &call.arguments,
            Err(CalcError::InvalidExpression(format!(
                "unknown tool '{}'",
                call.name
            ))),
        );
    }

    match serde_json::from_str::<CalculatorArgs>(&call.arguments) {
        Ok(args) => {
            let outcome = calculator::evaluate(&args.expression);
            CalculationResult::from_outcome(&args.expression, outcome)
        }
        Err(e) => CalculationResult::from_outcome(
            &call.arguments,
            Err(CalcError::InvalidExpression(format!(
                "malformed tool arguments: {}",
                e
            ))),
        ),
    }
}

fn handoff_prompt(history: &[ConversationMessage]) -> String {
    let expression = current_research_output(history).and_then(handoff_expression);

    match expression {
        Some(expr) => format!(
            "Use the calculator tool to compute `{}` and report the result.",
            expr
        ),
        None => "Use the calculator tool to perform the calculation requested above and report the result."
            .to_string(),
    }
}

/// Make sure a failed computation is visible in the final answer.
fn finalize(text: String, results: &[CalculationResult]) -> String {
    let text = match (text.trim().is_empty(), results.last()) {
        (true, Some(last)) if last.is_ok() => format!("The result is {}.", last.render()),
        _ => text,
    };

    match results.last() {
        Some(CalculationResult {
            expression,
            error: Some(error),
            ..
        }) if !text.to_lowercase().contains("could not compute") => {
            let note = format!("Note: could not compute `{}`: {}", expression, error);
            if text.trim().is_empty() {
                note
            } else {
                format!("{}\n\n{}", text.trim_end(), note)
            }
        }
        _ => text,
    }
}

#[async_trait]
impl Stage for CalculationStage {
    fn kind(&self) -> WorkflowStage {
        WorkflowStage::Calculation
    }

    async fn invoke(&self, history: &[ConversationMessage]) -> Result<StageOutput> {
        let mut messages = to_chat_history(history);
        messages.push(ChatMessage::user(handoff_prompt(history)));

        let mut results: Vec<CalculationResult> = Vec::new();
        let mut trace = Vec::new();

        for round in 1..=MAX_TOOL_ROUNDS {
            let response = self
                .model
                .complete(ChatRequest {
                    system: Some(SYSTEM_PROMPT.to_string()),
                    messages: messages.clone(),
                    tools: vec![calculator_tool()],
                })
                .await?;

            if response.tool_calls.is_empty() {
                info!(rounds = round, calculations = results.len(), "Calculation stage completed");
                return Ok(StageOutput {
                    content: finalize(response.text, &results),
                    trace,
                });
            }

            let content = Some(response.text).filter(|t| !t.trim().is_empty());
            messages.push(ChatMessage::tool_request(content, response.tool_calls.clone()));

            for call in &response.tool_calls {
                let result = run_tool_call(call);
                match &result.error {
                    None => trace.push(format!(
                        "calculator({}) = {}",
                        result.expression,
                        result.render()
                    )),
                    Some(error) => {
                        warn!(expression = %result.expression, error = %error, "Calculator rejected expression");
                        trace.push(format!("calculator({}) failed: {}", result.expression, error));
                    }
                }
                messages.push(ChatMessage::tool_result(call.id.clone(), result.render()));
                results.push(result);
            }
        }

        Err(OrchestrationError::StageError(format!(
            "calculation did not finish within {} tool rounds",
            MAX_TOOL_ROUNDS
        )))
    }
}
