//! Full turn against a mocked model endpoint: research finds the figures,
//! hands off to calculation, the calculator runs for real and the final
//! answer scores against the dataset answer.

use finqa_orchestrator::evaluation::{extract, parse_expected, validate, Tolerance};
use finqa_orchestrator::retrieval::ContextRetriever;
use finqa_orchestrator::session::{InMemorySessionStore, SessionStore};
use finqa_orchestrator::{Config, Coordinator, SessionId, WorkflowStage};
use std::io::Write;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

const QUESTION: &str =
    "what was the percentage change in the net cash from operating activities from 2008 to 2009";

/// Matches requests that do not yet carry a calculator result.
struct LacksToolResult;

impl Match for LacksToolResult {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains("\"role\":\"tool\"")
    }
}

fn dataset() -> tempfile::NamedTempFile {
    let record = serde_json::json!({
        "qa": {
            "question": QUESTION,
            "answer": "14.1%",
            "program": "subtract(206588, 181001), divide(#0, 181001)"
        },
        "pre_text": ["cash flows from operating activities increased in 2009."],
        "post_text": ["see note 7."],
        "table": [
            ["", "2009", "2008", "2007"],
            ["net cash from operating activities", "206588", "181001", "170000"]
        ],
        "filename": "JKHY/2009/page_28.pdf"
    });
    let other = serde_json::json!({
        "qa": {"question": "what was total revenue in 2007", "answer": "10", "program": ""},
        "table": [["revenue", "10"]]
    });

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", serde_json::json!([other, record])).unwrap();
    file
}

fn completion(message: serde_json::Value, finish_reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}]
    }))
}

async fn mount_model(server: &MockServer) {
    // research: must see the retrieved table
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("financial research expert"))
        .and(body_string_contains("206588 | 181001"))
        .respond_with(completion(
            serde_json::json!({
                "role": "assistant",
                "content": "<think>find the row</think>Net cash from operating activities was 181001 in 2008 and 206588 in 2009.\nNEED_MATH_CALCULATION: ((206588 - 181001) / 181001) * 100"
            }),
            "stop",
        ))
        .expect(1)
        .mount(server)
        .await;

    // calculation, first round: ask for the calculator
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("math expert"))
        .and(LacksToolResult)
        .respond_with(completion(
            serde_json::json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {
                        "name": "calculator",
                        "arguments": "{\"expression\": \"((206588 - 181001) / 181001) * 100\"}"
                    }
                }]
            }),
            "tool_calls",
        ))
        .expect(1)
        .mount(server)
        .await;

    // calculation, second round: the tool result is in the history
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("math expert"))
        .and(body_string_contains("\"role\":\"tool\""))
        .and(body_string_contains("14.136"))
        .respond_with(completion(
            serde_json::json!({
                "role": "assistant",
                "content": "The percentage change is 14.14%"
            }),
            "stop",
        ))
        .expect(1)
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> Config {
    let base_url = format!("{}/v1", server.uri());
    Config::from_lookup(|name| match name {
        "OPENAI_BASE_URL" => Some(base_url.clone()),
        "OPENAI_API_KEY" => Some("test-key".to_string()),
        "TURN_TIMEOUT_SECS" => Some("30".to_string()),
        _ => None,
    })
    .unwrap()
}

#[tokio::test]
async fn test_calculation_turn_end_to_end() {
    let server = MockServer::start().await;
    mount_model(&server).await;

    let file = dataset();
    let retriever = Arc::new(ContextRetriever::from_path(file.path()));
    assert!(!retriever.index().is_builtin());

    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let coordinator = Coordinator::from_config(&config(&server), retriever, sessions.clone()).unwrap();

    let session_id = SessionId::new("e2e");
    let result = coordinator.run_turn(&session_id, QUESTION).await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(
        result.stages,
        vec![WorkflowStage::Research, WorkflowStage::Calculation]
    );
    assert_eq!(result.answer, "The percentage change is 14.14%");
    assert!(!result.messages[1].content.contains("<think>"));
    assert!(result
        .trace
        .iter()
        .any(|line| line.starts_with("CALCULATION: calculator(")));

    let extracted = extract(&result.answer).unwrap();
    let expected = parse_expected("14.1%").unwrap();
    assert!(validate(extracted, expected, Tolerance::default()));

    let state = sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(state.len(), 3);
    assert_eq!(state.next_stage, WorkflowStage::Done);
}

#[tokio::test]
async fn test_unreachable_model_degrades_turn() {
    let config = Config::from_lookup(|name| match name {
        "OPENAI_BASE_URL" => Some("http://127.0.0.1:9/v1".to_string()),
        _ => None,
    })
    .unwrap();

    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let retriever = Arc::new(ContextRetriever::from_path("/no/such/dataset.json"));
    let coordinator = Coordinator::from_config(&config, retriever, sessions.clone()).unwrap();

    let session_id = SessionId::new("offline");
    let result = coordinator.run_turn(&session_id, QUESTION).await;

    assert!(result.is_degraded());
    assert_eq!(result.stages, vec![WorkflowStage::Research]);
    assert_eq!(sessions.get(&session_id).await.unwrap().unwrap().len(), 2);
}
