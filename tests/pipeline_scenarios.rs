//! Extraction pipeline and ceremony scenarios: fast-scan routing through
//! the worker, confidence-based detours, dead-lettering, behavior tiers,
//! exposure analysis, and the daily verification round-trip.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::ScriptedLlm;
use ei_lib::ceremony;
use ei_lib::config::Config;
use ei_lib::database::init_memory_database;
use ei_lib::engine::Engine;
use ei_lib::entities::store::{self, new_row_id};
use ei_lib::entities::{DataType, FactRow, PersonRow, TopicRow, HUMAN_ENTITY};
use ei_lib::extraction::{
    state, Confidence, ExposureAnalysisPayload, ExtractionEngine, FastScanPayload, ScanTarget,
    ValidationPayload,
};
use ei_lib::history::{self, NewMessage, Role};
use ei_lib::personas::PersonaRegistry;
use ei_lib::queue::{Priority, QueueWorker, TaskQueue, TaskType};
use ei_lib::utils::paths;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    db: sqlx::Pool<sqlx::Sqlite>,
    queue: Arc<TaskQueue>,
    extraction: Arc<ExtractionEngine>,
    worker: Arc<QueueWorker>,
    _tmp: tempfile::TempDir,
}

async fn pipeline(llm: Arc<ScriptedLlm>) -> Pipeline {
    let tmp = tempfile::tempdir().unwrap();
    let db = init_memory_database().await.unwrap();
    let registry = Arc::new(tokio::sync::Mutex::new(
        PersonaRegistry::load(tmp.path().join("personas.json")).unwrap(),
    ));
    let queue = Arc::new(TaskQueue::new(db.clone(), false));
    let extraction = Arc::new(ExtractionEngine::new(
        db.clone(),
        llm,
        queue.clone(),
        registry,
    ));
    let worker = Arc::new(QueueWorker::new(queue.clone(), extraction.clone()));
    Pipeline {
        db,
        queue,
        extraction,
        worker,
        _tmp: tmp,
    }
}

async fn seed_human_message(db: &sqlx::Pool<sqlx::Sqlite>, persona: &str, content: &str) -> String {
    history::append(
        db,
        NewMessage {
            persona,
            role: Role::Human,
            content,
            read: true,
            concept_processed: false,
            state: None,
            metadata: None,
        },
    )
    .await
    .unwrap()
    .id
}

async fn wait_for_drain(queue: &TaskQueue) {
    for _ in 0..200 {
        if queue.depth().await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("queue never drained");
}

#[tokio::test(start_paused = true)]
async fn fast_scan_routes_mentions_and_new_items_through_worker() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    // Known fact, with the fact gate satisfied.
    store::upsert_fact(
        &p.db,
        &FactRow {
            id: new_row_id(),
            entity: HUMAN_ENTITY.to_string(),
            name: "Birthday".to_string(),
            description: "sometime in spring".to_string(),
            sentiment: 0.0,
            confidence: 0.6,
            last_confirmed: None,
            persona_groups: Default::default(),
            learned_by: Some("ei".to_string()),
        },
    )
    .await
    .unwrap();
    for _ in 0..10 {
        state::increment_messages(&p.db, HUMAN_ENTITY, "ei", &[DataType::Fact])
            .await
            .unwrap();
    }

    let msg_id = seed_human_message(
        &p.db,
        "ei",
        "I have a cat named Pip, and my birthday is in May",
    )
    .await;

    // Phase A result, then the two phase-B updates in enqueue order.
    llm.push_json(serde_json::json!({
        "mentioned": [{"name": "Birthday", "type": "fact", "confidence": "high"}],
        "new_items": [{"name": "Pip", "type": "person", "confidence": "high", "reason": "named cat"}]
    }));
    llm.push_json(serde_json::json!({
        "description": "birthday is in May",
        "sentiment": 0.2,
        "confidence": 0.9
    }));
    llm.push_json(serde_json::json!({
        "relationship": "pet",
        "description": "a cat named Pip",
        "sentiment": 0.6,
        "level_current": 0.6,
        "level_ideal": 0.6
    }));

    p.queue
        .enqueue(
            TaskType::FastScan,
            Priority::High,
            &FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::Human,
                message_ids: vec![msg_id.clone()],
            },
        )
        .await
        .unwrap();

    p.worker.start().await;
    wait_for_drain(&p.queue).await;
    p.worker.stop().await;

    let birthday = store::get_fact(&p.db, HUMAN_ENTITY, "Birthday")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(birthday.description, "birthday is in May");
    assert_eq!(birthday.confidence, 0.9);
    assert_eq!(birthday.learned_by.as_deref(), Some("ei"));

    let pip = store::get_person(&p.db, HUMAN_ENTITY, "Pip")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pip.relationship, "pet");

    let messages = history::load_by_ids(&p.db, &[msg_id]).await.unwrap();
    assert!(messages[0].concept_processed);

    // A successful detail update resets the fact counter.
    let fact_state = state::get_state(&p.db, HUMAN_ENTITY, "ei", DataType::Fact)
        .await
        .unwrap();
    assert_eq!(fact_state.messages_since_last_extract, 0);
    assert_eq!(fact_state.total_extractions, 1);
}

#[tokio::test(start_paused = true)]
async fn low_confidence_items_detour_to_validation() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    let msg_id = seed_human_message(&p.db, "ei", "maybe I'll take up beekeeping").await;

    llm.push_json(serde_json::json!({
        "mentioned": [],
        "new_items": [{"name": "beekeeping", "type": "topic", "confidence": "low",
                        "reason": "only hypothetical"}]
    }));

    p.queue
        .enqueue(
            TaskType::FastScan,
            Priority::Normal,
            &FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::Human,
                message_ids: vec![msg_id],
            },
        )
        .await
        .unwrap();

    p.worker.start().await;
    wait_for_drain(&p.queue).await;
    p.worker.stop().await;

    // Nothing was written; the proposal waits for human verification.
    assert!(store::get_topic(&p.db, HUMAN_ENTITY, "beekeeping")
        .await
        .unwrap()
        .is_none());

    let pending = p.queue.pending_validations().await.unwrap();
    assert_eq!(pending.len(), 1);
    let payload: ValidationPayload = pending[0].payload_as().unwrap();
    assert_eq!(payload.name, "beekeeping");
    assert_eq!(payload.validation_type, "data_confirm");
    assert_eq!(payload.confidence, Confidence::Low);
}

#[tokio::test(start_paused = true)]
async fn proposed_items_matching_persona_names_are_dropped() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    let msg_id = seed_human_message(&p.db, "ei", "ei, you would love this book").await;

    llm.push_json(serde_json::json!({
        "mentioned": [],
        "new_items": [{"name": "ei", "type": "person", "confidence": "high",
                        "reason": "mentioned by name"}]
    }));

    p.queue
        .enqueue(
            TaskType::FastScan,
            Priority::Normal,
            &FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::Human,
                message_ids: vec![msg_id],
            },
        )
        .await
        .unwrap();

    p.worker.start().await;
    wait_for_drain(&p.queue).await;
    p.worker.stop().await;

    assert!(store::get_person(&p.db, HUMAN_ENTITY, "ei").await.unwrap().is_none());
    assert!(p.queue.pending_validations().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_task_dead_letters_after_three_attempts() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    let msg_id = seed_human_message(&p.db, "ei", "hello").await;
    for _ in 0..3 {
        llm.push(common::Scripted::Fail("backend down".to_string()));
    }

    p.queue
        .enqueue(
            TaskType::FastScan,
            Priority::Normal,
            &FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::Human,
                message_ids: vec![msg_id],
            },
        )
        .await
        .unwrap();

    p.worker.start().await;
    wait_for_drain(&p.queue).await;
    // Give the worker a chance to (wrongly) retry a removed item.
    tokio::time::sleep(Duration::from_secs(5)).await;
    p.worker.stop().await;

    assert_eq!(llm.call_count(), 3, "no attempts after dead-letter");
    assert_eq!(p.queue.depth().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn aborted_fast_scan_is_dropped_from_the_queue() {
    let llm = Arc::new(ScriptedLlm::with_delay(Duration::from_secs(30)));
    let p = pipeline(llm.clone()).await;

    let msg_id = seed_human_message(&p.db, "ei", "hello").await;
    p.queue
        .enqueue(
            TaskType::FastScan,
            Priority::Normal,
            &FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::Human,
                message_ids: vec![msg_id],
            },
        )
        .await
        .unwrap();

    p.worker.start().await;
    for _ in 0..100 {
        if llm.call_count() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(llm.call_count(), 1, "scan should be in flight");

    // Conversational preemption aborts the in-flight scan.
    p.worker.pause();
    tokio::time::sleep(Duration::from_secs(1)).await;
    p.worker.stop().await;

    assert_eq!(
        p.queue.depth().await.unwrap(),
        0,
        "aborted fast-scans drop instead of retrying"
    );
}

#[tokio::test(start_paused = true)]
async fn aborted_detail_update_stays_queued_without_attempts() {
    let llm = Arc::new(ScriptedLlm::with_delay(Duration::from_secs(30)));
    let p = pipeline(llm.clone()).await;

    p.queue
        .enqueue(
            TaskType::DetailUpdate,
            Priority::Normal,
            &ei_lib::extraction::DetailUpdatePayload {
                persona: "ei".to_string(),
                entity: HUMAN_ENTITY.to_string(),
                data_type: DataType::Topic,
                name: "sailing".to_string(),
                context: None,
                message_ids: vec![],
            },
        )
        .await
        .unwrap();

    p.worker.start().await;
    for _ in 0..100 {
        if llm.call_count() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(llm.call_count(), 1, "update should be in flight");

    p.worker.pause();
    tokio::time::sleep(Duration::from_secs(1)).await;
    p.worker.stop().await;

    let item = p.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(item.task_type, TaskType::DetailUpdate);
    assert_eq!(item.attempts, 0, "an abort never counts as an attempt");
}

#[tokio::test(start_paused = true)]
async fn conversational_content_does_not_mutate_persona_traits() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    let msg_id = seed_human_message(&p.db, "ei", "pirates say arr, did you know?").await;

    llm.push_json(serde_json::json!({"mentioned": [], "new_items": []}));
    llm.push_json(serde_json::json!({"requests_change": false}));

    p.extraction
        .run_fast_scan(
            FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::System,
                message_ids: vec![msg_id],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(store::list_traits(&p.db, "ei").await.unwrap().is_empty());
    // Gate said no, so tiers 2 and 3 never ran.
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_behavior_request_lands_as_trait() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    let msg_id =
        seed_human_message(&p.db, "ei", "from now on, please answer only in haiku").await;

    llm.push_json(serde_json::json!({"mentioned": [], "new_items": []}));
    llm.push_json(serde_json::json!({"requests_change": true}));
    llm.push_json(serde_json::json!({"behavior": "always answer in haiku"}));
    llm.push_json(serde_json::json!({
        "name": "haiku speech",
        "description": "responds in haiku form",
        "sentiment": 0.1,
        "strength": 0.8
    }));

    p.extraction
        .run_fast_scan(
            FastScanPayload {
                persona: "ei".to_string(),
                target: ScanTarget::System,
                message_ids: vec![msg_id],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let traits = store::list_traits(&p.db, "ei").await.unwrap();
    assert_eq!(traits.len(), 1);
    assert_eq!(traits[0].name, "haiku speech");
    assert_eq!(traits[0].strength, 0.8);

    // A trait change schedules a description refresh.
    let next = p.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(next.task_type, TaskType::DescriptionRegen);
}

#[tokio::test(start_paused = true)]
async fn exposure_analysis_applies_deltas_and_decays_the_rest() {
    let llm = Arc::new(ScriptedLlm::new());
    let p = pipeline(llm.clone()).await;

    let now = Utc::now();
    store::upsert_topic(
        &p.db,
        &TopicRow {
            id: new_row_id(),
            entity: HUMAN_ENTITY.to_string(),
            name: "sailing".to_string(),
            description: String::new(),
            sentiment: 0.0,
            level_current: 0.5,
            level_ideal: 0.5,
            last_updated: now,
            persona_groups: Default::default(),
            learned_by: None,
        },
    )
    .await
    .unwrap();
    store::upsert_topic(
        &p.db,
        &TopicRow {
            id: new_row_id(),
            entity: HUMAN_ENTITY.to_string(),
            name: "chess".to_string(),
            description: String::new(),
            sentiment: 0.0,
            level_current: 0.9,
            level_ideal: 0.3,
            last_updated: now - chrono::Duration::days(10),
            persona_groups: Default::default(),
            learned_by: None,
        },
    )
    .await
    .unwrap();

    let msg_id = seed_human_message(&p.db, "ei", "went sailing all weekend!").await;

    llm.push_json(serde_json::json!({"deltas": {"sailing": 0.3}}));

    p.extraction
        .run_exposure_analysis(
            ExposureAnalysisPayload {
                persona: "ei".to_string(),
                message_ids: vec![msg_id],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let sailing = store::get_topic(&p.db, HUMAN_ENTITY, "sailing").await.unwrap().unwrap();
    assert!((sailing.level_current - 0.8).abs() < 1e-9);

    // Untouched topic decayed toward its ideal.
    let chess = store::get_topic(&p.db, HUMAN_ENTITY, "chess").await.unwrap().unwrap();
    assert!(chess.level_current < 0.9);
    assert!(chess.level_current > 0.3);
}

// ---------------------------------------------------------------------------
// Ceremony
// ---------------------------------------------------------------------------

fn engine_config(dir: &std::path::Path) -> Config {
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

#[tokio::test(start_paused = true)]
async fn ceremony_round_trip_applies_outcomes() {
    let llm = Arc::new(ScriptedLlm::new());
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _events) = Engine::new(engine_config(tmp.path()), llm.clone())
        .await
        .unwrap();
    engine.pause_background();
    let db = ei_lib::database::init_database(&paths::db_path(tmp.path()))
        .await
        .unwrap();

    // Existing rows the validations refer to.
    store::upsert_fact(
        &db,
        &FactRow {
            id: new_row_id(),
            entity: HUMAN_ENTITY.to_string(),
            name: "Birthday".to_string(),
            description: "in May".to_string(),
            sentiment: 0.0,
            confidence: 0.4,
            last_confirmed: None,
            persona_groups: Default::default(),
            learned_by: Some("ei".to_string()),
        },
    )
    .await
    .unwrap();
    store::upsert_person(
        &db,
        &PersonRow {
            id: new_row_id(),
            entity: HUMAN_ENTITY.to_string(),
            name: "Pip".to_string(),
            relationship: "pet".to_string(),
            description: "a cat".to_string(),
            sentiment: 0.5,
            level_current: 0.5,
            level_ideal: 0.5,
            last_updated: Utc::now(),
            persona_groups: Default::default(),
            learned_by: Some("ei".to_string()),
        },
    )
    .await
    .unwrap();

    // Three pending validations, seeded through the same queue table.
    let seed_queue = TaskQueue::new(db.clone(), false);
    for (name, data_type) in [
        ("Birthday", DataType::Fact),
        ("May", DataType::Fact),
        ("Pip", DataType::Person),
    ] {
        seed_queue
            .enqueue(
                TaskType::EiValidation,
                Priority::Low,
                &ValidationPayload {
                    validation_type: "data_confirm".to_string(),
                    persona: "ei".to_string(),
                    entity: HUMAN_ENTITY.to_string(),
                    data_type,
                    name: name.to_string(),
                    confidence: Confidence::Low,
                    reason: None,
                },
            )
            .await
            .unwrap();
    }

    let inner = engine.inner();
    let status = ceremony::run_manual(&inner, None).await.unwrap();
    assert!(status.contains("3"));

    // The ceremony question is in the primary persona's history.
    let recent = history::load_recent(&db, "ei").await.unwrap();
    assert!(recent.iter().any(|m| m.content.contains("Birthday")));

    // Parsed outcome of the user's reply.
    llm.push_json(serde_json::json!({
        "confirmed": ["Birthday"],
        "roleplay": [{"name": "Pip", "group": "Campaign X"}]
    }));

    engine
        .submit_to(
            "ei",
            "Birthday is correct; I don't have a cat named Pip — that was roleplay \
             for a game called Campaign X",
        )
        .await
        .unwrap();

    let birthday = store::get_fact(&db, HUMAN_ENTITY, "Birthday").await.unwrap().unwrap();
    assert_eq!(birthday.confidence, 1.0);
    assert!(birthday.last_confirmed.is_some());

    let pip = store::get_person(&db, HUMAN_ENTITY, "Pip").await.unwrap().unwrap();
    assert!(pip.persona_groups.contains("Campaign X"));
    assert_eq!(pip.persona_groups.len(), 1);

    // The unmentioned item stays pending, both in the queue and for the
    // heartbeat-suppression check.
    let remaining: Vec<String> = seed_queue
        .pending_validations()
        .await
        .unwrap()
        .iter()
        .map(|item| item.payload_as::<ValidationPayload>().unwrap().name)
        .collect();
    assert_eq!(remaining, vec!["May".to_string()]);
    assert!(ceremony::has_pending(&inner).await.unwrap());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ceremony_pending_suppresses_primary_heartbeat() {
    let llm = Arc::new(ScriptedLlm::new());
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _events) = Engine::new(engine_config(tmp.path()), llm.clone())
        .await
        .unwrap();
    engine.pause_background();
    let db = ei_lib::database::init_database(&paths::db_path(tmp.path()))
        .await
        .unwrap();

    // A gap large enough that a normal tick would self-initiate.
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

    let seed_queue = TaskQueue::new(db.clone(), false);
    seed_queue
        .enqueue(
            TaskType::EiValidation,
            Priority::Low,
            &ValidationPayload {
                validation_type: "data_confirm".to_string(),
                persona: "ei".to_string(),
                entity: HUMAN_ENTITY.to_string(),
                data_type: DataType::Fact,
                name: "Birthday".to_string(),
                confidence: Confidence::Low,
                reason: None,
            },
        )
        .await
        .unwrap();

    let inner = engine.inner();
    ceremony::run_manual(&inner, None).await.unwrap();
    let calls_after_ceremony = llm.call_count();

    ei_lib::engine::heartbeat::tick(&inner, "ei").await.unwrap();

    assert_eq!(
        llm.call_count(),
        calls_after_ceremony,
        "heartbeat must stay silent while the ceremony awaits its reply"
    );

    engine.shutdown().await.unwrap();
}
