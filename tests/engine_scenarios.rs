//! End-to-end scenarios for the per-persona scheduler: debounce,
//! duplicate suppression, pause/resume coalescing, abort-on-new-input,
//! heartbeat thresholds, and undo.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::ScriptedLlm;
use ei_lib::commands::{self, Command};
use ei_lib::config::Config;
use ei_lib::engine::events::EventReceiver;
use ei_lib::engine::{heartbeat, Engine};
use ei_lib::entities::store::{self, new_row_id};
use ei_lib::entities::TopicRow;
use ei_lib::history::{self, MessageState, Role};
use ei_lib::llm::Operation;
use ei_lib::utils::paths;

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        default_model: Some("anthropic:claude-sonnet-4-5".to_string()),
        model_response: None,
        model_concept: None,
        model_generation: None,
        custom_base_url: None,
        custom_api_key: None,
        log_usage: false,
        debug: false,
        skip_repo_check: true,
        ceremony_hour: 9,
        ceremony_minute: 0,
    }
}

async fn test_engine(
    llm: Arc<ScriptedLlm>,
) -> (Engine, EventReceiver, sqlx::Pool<sqlx::Sqlite>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (engine, events) = Engine::new(config, llm).await.unwrap();
    // Second handle onto the same database file, for assertions.
    let db = ei_lib::database::init_database(&paths::db_path(tmp.path()))
        .await
        .unwrap();
    (engine, events, db, tmp)
}

/// Wait (in paused-clock time) until the scripted LLM has seen `count`
/// calls of the given operation.
async fn wait_for_calls(llm: &ScriptedLlm, operation: Operation, count: usize) {
    for _ in 0..200 {
        if llm.calls_for(operation).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "Timed out waiting for {} {:?} calls (saw {})",
        count,
        operation,
        llm.calls_for(operation).len()
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_yields_one_message_and_one_call() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("hello there!");
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    engine.submit("hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine.submit("hi").await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    let recent = history::load_recent(&db, "ei").await.unwrap();
    let human: Vec<_> = recent.iter().filter(|m| m.role == Role::Human).collect();
    assert_eq!(human.len(), 1, "duplicate should not reach history");
    assert_eq!(llm.calls_for(Operation::Response).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resubmission_after_window_is_a_new_message() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("first");
    llm.push_text("second");
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    engine.submit("hi").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    engine.submit("hi").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let recent = history::load_recent(&db, "ei").await.unwrap();
    let human: Vec<_> = recent.iter().filter(|m| m.role == Role::Human).collect();
    assert_eq!(human.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn long_message_bypasses_debounce() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("summary coming up");
    let (engine, _events, _db, _tmp) = test_engine(llm.clone()).await;

    let start = tokio::time::Instant::now();
    engine
        .submit("please summarize the last conversation")
        .await
        .unwrap();

    wait_for_calls(&llm, Operation::Response, 1).await;
    assert!(
        start.elapsed() < Duration::from_millis(2000),
        "a complete thought must not wait out the debounce"
    );
}

#[tokio::test(start_paused = true)]
async fn short_message_waits_for_debounce() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("hey!");
    let (engine, _events, _db, _tmp) = test_engine(llm.clone()).await;

    engine.submit("hey").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        llm.calls_for(Operation::Response).len(),
        0,
        "short text should still be debouncing"
    );

    wait_for_calls(&llm, Operation::Response, 1).await;
}

#[tokio::test(start_paused = true)]
async fn pause_queues_then_resume_coalesces() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("caught up!");
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    engine
        .pause("ei", Some(chrono::Duration::minutes(30)))
        .await
        .unwrap();
    engine.submit("A").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    engine.submit("B").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(llm.call_count(), 0, "paused persona must not call the LLM");
    let recent = history::load_recent(&db, "ei").await.unwrap();
    let queued: Vec<_> = recent
        .iter()
        .filter(|m| m.state == Some(MessageState::Queued))
        .collect();
    assert_eq!(queued.len(), 2, "both messages persisted as queued");

    engine.resume("ei").await.unwrap();
    wait_for_calls(&llm, Operation::Response, 1).await;

    let calls = llm.calls_for(Operation::Response);
    assert_eq!(calls[0].user, "A\nB", "queued messages coalesce into one request");
}

#[tokio::test(start_paused = true)]
async fn pause_expiry_auto_resumes() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("back!");
    let (engine, _events, _db, _tmp) = test_engine(llm.clone()).await;

    engine
        .pause("ei", Some(chrono::Duration::minutes(5)))
        .await
        .unwrap();
    engine.submit("are you there").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(llm.call_count(), 0);

    // Let the pause timer fire.
    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    wait_for_calls(&llm, Operation::Response, 1).await;
}

#[tokio::test(start_paused = true)]
async fn new_input_aborts_inflight_response() {
    // The first call is aborted before it consumes a scripted response,
    // so only the superseding request's reply is queued.
    let llm = Arc::new(ScriptedLlm::with_delay(Duration::from_secs(5)));
    llm.push_text("delivered");
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    engine
        .submit("tell me a very long story about dragons")
        .await
        .unwrap();
    wait_for_calls(&llm, Operation::Response, 1).await;

    engine
        .submit("actually nevermind, short joke instead!")
        .await
        .unwrap();
    wait_for_calls(&llm, Operation::Response, 2).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let recent = history::load_recent(&db, "ei").await.unwrap();
    let states: Vec<_> = recent
        .iter()
        .filter(|m| m.role == Role::Human)
        .map(|m| m.state)
        .collect();
    assert_eq!(
        states,
        vec![Some(MessageState::Failed), Some(MessageState::Sent)],
        "aborted message fails, superseding message completes"
    );

    // Exactly one system response (for the second message).
    let responses: Vec<_> = recent.iter().filter(|m| m.role == Role::System).collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].content, "delivered");
}

#[tokio::test(start_paused = true)]
async fn heartbeat_below_threshold_makes_no_llm_calls() {
    let llm = Arc::new(ScriptedLlm::new());
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    store::upsert_topic(
        &db,
        &TopicRow {
            id: new_row_id(),
            entity: "ei".to_string(),
            name: "gardening".to_string(),
            description: String::new(),
            sentiment: 0.0,
            level_current: 0.5,
            level_ideal: 0.6,
            last_updated: Utc::now(),
            persona_groups: Default::default(),
            learned_by: None,
        },
    )
    .await
    .unwrap();

    heartbeat::tick(&engine.inner(), "ei").await.unwrap();

    assert_eq!(llm.call_count(), 0, "gap 0.1 is decay-only");
}

#[tokio::test(start_paused = true)]
async fn heartbeat_past_threshold_self_initiates() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("I was just thinking about our garden plans...");
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    store::upsert_topic(
        &db,
        &TopicRow {
            id: new_row_id(),
            entity: "ei".to_string(),
            name: "gardening".to_string(),
            description: String::new(),
            sentiment: 0.0,
            level_current: 0.1,
            level_ideal: 0.9,
            last_updated: Utc::now(),
            persona_groups: Default::default(),
            learned_by: None,
        },
    )
    .await
    .unwrap();

    heartbeat::tick(&engine.inner(), "ei").await.unwrap();

    assert_eq!(llm.calls_for(Operation::Response).len(), 1);
    let recent = history::load_recent(&db, "ei").await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].role, Role::System);
    assert!(recent[0].content.contains("garden"));
}

#[tokio::test(start_paused = true)]
async fn undo_reverts_persona_creation() {
    let llm = Arc::new(ScriptedLlm::new());
    let (engine, _events, _db, _tmp) = test_engine(llm.clone()).await;

    let status = engine
        .execute(commands::parse("/p Bob").unwrap())
        .await
        .unwrap();
    assert!(status.contains("Created persona 'Bob'"));
    assert!(engine.status().await.unwrap().contains("Bob"));

    let undo = engine
        .execute(Command::Undo { steps: 1 })
        .await
        .unwrap();
    assert!(undo.contains("Undid"));
    assert!(
        !engine.status().await.unwrap().contains("Bob"),
        "Bob should be gone after undo"
    );

    let empty = engine
        .execute(Command::Undo { steps: 1 })
        .await
        .unwrap();
    assert_eq!(empty, "No undo history");
}

#[tokio::test(start_paused = true)]
async fn archived_persona_rejects_messages() {
    let llm = Arc::new(ScriptedLlm::new());
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    engine.execute(commands::parse("/p Bob").unwrap()).await.unwrap();
    engine.archive("Bob").await.unwrap();

    // Focus fell back to the primary persona.
    assert_eq!(engine.focused().await, "ei");

    engine.submit_to("Bob", "hello?").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(llm.call_count(), 0);
    assert!(history::load_recent(&db, "Bob").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn switch_enqueues_fast_scans_for_previous_persona() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_text("hi!");
    let (engine, _events, db, _tmp) = test_engine(llm.clone()).await;

    engine.submit("my birthday is in May, by the way").await.unwrap();
    wait_for_calls(&llm, Operation::Response, 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Stop the worker so the queued scans stay observable.
    engine.pause_background();

    engine.execute(commands::parse("/p Bob").unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let queue = ei_lib::queue::TaskQueue::new(db, false);
    assert!(
        queue.depth().await.unwrap() >= 2,
        "switch should queue human and system fast scans"
    );
}
