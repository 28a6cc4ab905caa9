use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use margin_cli::{JsonFilePersistence, Scenario, run_scenario};
use margin_core::Config;
use margin_core::session::{PatchStatus, Role};

fn scenario(value: serde_json::Value) -> Scenario {
    serde_json::from_value(value).unwrap()
}

fn done() -> serde_json::Value {
    json!({ "after_ms": 5, "event": { "type": "done", "status": "complete" } })
}

#[tokio::test(start_paused = true)]
async fn test_reply_and_accepted_patch_are_saved() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let script = scenario(json!({
        "conversation_id": "notes",
        "document": { "path": "notes.md", "text": "# Notes\ntodo\n" },
        "jobs": [{ "events": [
            { "after_ms": 10, "event": { "type": "delta", "text": "Filling in the list." } },
            { "after_ms": 10, "event": { "type": "patch", "kind": "replaceRangeInFile",
                "anchor": { "type": "file_range", "path": "notes.md", "start_line": 2,
                            "end_line": 2, "expected_text": "todo" },
                "text": "- write tests" } },
            done()
        ] }],
        "steps": [
            { "step": "submit", "text": "Fill in the list" },
            { "step": "wait_idle" },
            { "step": "accept_latest" }
        ]
    }));

    let report = run_scenario(script, Config::default(), store.clone(), None)
        .await
        .unwrap();

    assert_eq!(report.document, "# Notes\n- write tests\n");
    assert_eq!(report.unused_jobs, 0);

    let roles: Vec<Role> = report.snapshot.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Assistant]);
    assert_eq!(report.snapshot.messages[1].content, "Filling in the list.");
    let review = report.snapshot.messages[2].patch.as_ref().unwrap();
    assert_eq!(review.status, PatchStatus::Accepted);

    let saved = store.load("notes").unwrap().unwrap();
    assert_eq!(saved.messages.len(), 3);
    assert_eq!(
        saved.messages[2].patch.as_ref().unwrap().status,
        PatchStatus::Accepted
    );
}

#[tokio::test(start_paused = true)]
async fn test_rewrite_selection_applies_to_document() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let script = scenario(json!({
        "conversation_id": "rewrite",
        "document": { "text": "teh quick fox", "selection": [0, 3] },
        "jobs": [{ "events": [
            { "after_ms": 10, "event": { "type": "patch", "kind": "replaceSelection",
                "anchor": { "type": "selection", "start": 0, "end": 3, "expected_text": "teh" },
                "text": "the" } },
            done()
        ] }],
        "steps": [
            { "step": "submit", "text": "Fix the typo", "rewrite_selection": true },
            { "step": "wait_idle" },
            { "step": "accept_latest" }
        ]
    }));

    let report = run_scenario(script, Config::default(), store, None)
        .await
        .unwrap();
    assert_eq!(report.document, "the quick fox");
}

#[tokio::test(start_paused = true)]
async fn test_feedback_refines_before_accept() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let patch = |text: &str| {
        json!({ "after_ms": 10, "event": { "type": "patch", "kind": "insertAtCursor",
            "anchor": { "type": "cursor", "position": 0 }, "text": text } })
    };
    let script = scenario(json!({
        "conversation_id": "refine",
        "document": { "text": "body" },
        "jobs": [
            { "events": [patch("A very long title\n"), done()] },
            { "events": [patch("Title\n"), done()] }
        ],
        "steps": [
            { "step": "submit", "text": "Add a title" },
            { "step": "wait_idle" },
            { "step": "feedback_latest", "text": "Shorter" },
            { "step": "wait_idle" },
            { "step": "accept_latest" }
        ]
    }));

    let report = run_scenario(script, Config::default(), store, None)
        .await
        .unwrap();

    assert_eq!(report.document, "Title\nbody");
    let cards: Vec<_> = report
        .snapshot
        .messages
        .iter()
        .filter_map(|m| m.patch.as_ref())
        .collect();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].revision, 1);
    assert_eq!(cards[0].status, PatchStatus::Accepted);
}

#[tokio::test(start_paused = true)]
async fn test_saved_history_is_restored() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));
    let turn = |text: &str| {
        scenario(json!({
            "conversation_id": "twice",
            "jobs": [{ "events": [
                { "after_ms": 1, "event": { "type": "delta", "text": "ok" } },
                done()
            ] }],
            "steps": [{ "step": "submit", "text": text }]
        }))
    };

    run_scenario(turn("first"), Config::default(), store.clone(), None)
        .await
        .unwrap();
    let history = store.load("twice").unwrap().map(|saved| saved.into_state());
    let report = run_scenario(turn("second"), Config::default(), store.clone(), history)
        .await
        .unwrap();

    let contents: Vec<&str> = report
        .snapshot
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["first", "ok", "second", "ok"]);
    assert_eq!(store.load("twice").unwrap().unwrap().messages.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_missing_reply_becomes_system_message() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let script = scenario(json!({
        "conversation_id": "empty",
        "steps": [{ "step": "submit", "text": "hello?" }]
    }));

    let report = run_scenario(script, Config::default(), store, None)
        .await
        .unwrap();
    let last = report.snapshot.messages.last().unwrap();
    assert_eq!(last.role, Role::System);
    assert!(last.content.contains("No scripted reply left"));
}

#[tokio::test(start_paused = true)]
async fn test_accept_without_patch_fails() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let script = scenario(json!({
        "conversation_id": "nothing",
        "steps": [{ "step": "accept_latest" }]
    }));

    let err = run_scenario(script, Config::default(), store, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Step 1"));
}

#[tokio::test(start_paused = true)]
async fn test_bundled_demo_replays() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/rename-variable.json");
    let script = Scenario::load(&path).unwrap();
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let report = run_scenario(script, Config::default(), store, None)
        .await
        .unwrap();

    assert_eq!(
        report.document,
        "pub fn area(w: f64, h: f64) -> f64 {\n    w * h\n}\n"
    );
    assert_eq!(report.snapshot.usage.unwrap().used, 1830);
    let assistant = &report.snapshot.messages[1];
    assert_eq!(
        assistant.content,
        "The local `x` hides what it holds. I suggest naming it `area`."
    );
    assert!(assistant.status_line.as_deref().unwrap().starts_with("Thought for"));
}

#[tokio::test(start_paused = true)]
async fn test_tool_response_reaches_backend() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonFilePersistence::new(temp.path()));

    let script = scenario(json!({
        "conversation_id": "tools",
        "jobs": [{ "events": [
            { "after_ms": 10, "event": { "type": "tool_call", "request_id": "r1",
                "kind": "approval", "prompt": "Run cargo fmt?" } },
            { "after_ms": 200, "event": { "type": "delta", "text": "Formatted." } },
            done()
        ] }],
        "steps": [
            { "step": "submit", "text": "Tidy up" },
            { "step": "wait", "ms": 50 },
            { "step": "respond_to_tool", "request_id": "r1", "result": { "approved": true } },
            { "step": "wait_idle" }
        ]
    }));

    let report = run_scenario(script, Config::default(), store, None)
        .await
        .unwrap();
    assert_eq!(report.jobs_created, 1);
    assert_eq!(report.tool_responses, 1);
    assert!(report.snapshot.active_tool_request.is_none());
}
