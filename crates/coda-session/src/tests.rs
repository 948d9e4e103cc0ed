use std::{sync::Arc, thread};

use coda_core::{CodaError, ErrorCode};
use serde_json::json;
use tempfile::tempdir;

use super::{
    AppendFaultHook, AppendStage, CreateSessionOptions, Event, EventAuthor, EventPart,
    SessionStore, SessionStoreOptions, StateMap,
};

fn state(value: serde_json::Value) -> StateMap {
    serde_json::from_value(value).expect("state map")
}

fn open_store(dir: &std::path::Path) -> SessionStore {
    SessionStore::open(dir.join("sessions.sqlite")).expect("open store")
}

#[test]
fn functional_create_session_round_trips_and_routes_initial_state() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());

    let created = store
        .create_session(
            "coda",
            "alice",
            "demo",
            CreateSessionOptions {
                initial_state: state(json!({
                    "app:model": "gpt-4o-mini",
                    "user:lang": "en",
                    "temp:skip": 1,
                    "topic": "rust"
                })),
                resume_existing: false,
            },
        )
        .expect("create");

    assert!(created.id.starts_with("ses-"));
    assert_eq!(created.create_time_ms, created.update_time_ms);
    assert_eq!(
        created.state,
        state(json!({"model": "gpt-4o-mini", "lang": "en", "topic": "rust"}))
    );

    let fetched = store.get_session(&created.id).expect("get").expect("exists");
    assert_eq!(fetched, created);

    let layers = store.load_state_layers(&created.id).expect("layers");
    assert_eq!(layers.app, state(json!({"model": "gpt-4o-mini"})));
    assert_eq!(layers.user, state(json!({"lang": "en"})));
    assert_eq!(layers.session, state(json!({"topic": "rust"})));

    assert!(store.get_session("ses-missing").expect("get").is_none());
}

#[test]
fn regression_duplicate_session_triple_fails_unless_resuming() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let first = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");

    let error = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect_err("duplicate must fail");
    assert_eq!(error.code(), ErrorCode::Internal);
    assert!(error.message().contains("already exists"));
    assert_eq!(error.context_value("name"), Some("demo"));

    let resumed = store
        .create_session(
            "coda",
            "alice",
            "demo",
            CreateSessionOptions {
                resume_existing: true,
                ..CreateSessionOptions::default()
            },
        )
        .expect("resume");
    assert_eq!(resumed.id, first.id);

    let other_user = store
        .create_session("coda", "bob", "demo", CreateSessionOptions::default())
        .expect("same name for another user");
    assert_ne!(other_user.id, first.id);

    let found = store
        .find_session("coda", "alice", "demo")
        .expect("find")
        .expect("exists");
    assert_eq!(found.id, first.id);
}

#[test]
fn regression_create_session_rejects_blank_identifiers() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let error = store
        .create_session("coda", " ", "demo", CreateSessionOptions::default())
        .expect_err("blank user");
    assert_eq!(error.code(), ErrorCode::InvalidInput);
}

#[test]
fn functional_append_event_applies_all_layers_and_advances_update_time() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");
    let sibling = store
        .create_session("coda", "alice", "sibling", CreateSessionOptions::default())
        .expect("create sibling");

    let stored = store
        .append_event_owned(
            &session.id,
            Event::user_text("hello").with_state_delta(state(json!({
                "app:a": 1,
                "user:a": 2,
                "user:b": 3,
                "b": 4,
                "temp:scratch": "x"
            }))),
        )
        .expect("append");

    assert!(stored.id.starts_with("evt-"));
    assert_eq!(stored.session_id, session.id);
    assert!(stored.timestamp_ms >= session.update_time_ms);
    assert!(!stored.state_delta.contains_key("temp:scratch"));

    let refreshed = store.get_session(&session.id).expect("get").expect("exists");
    assert_eq!(refreshed.state, state(json!({"a": 2, "b": 4})));
    assert_eq!(refreshed.update_time_ms, stored.timestamp_ms);

    let sibling = store.get_session(&sibling.id).expect("get").expect("exists");
    assert_eq!(sibling.state, state(json!({"a": 2, "b": 3})));

    let events = store
        .read_events(&session.id, None)
        .expect("cursor")
        .collect::<Result<Vec<_>, CodaError>>()
        .expect("events");
    assert_eq!(events, vec![stored]);
}

#[test]
fn functional_partial_events_are_persisted_without_state_application() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");

    store
        .append_event_owned(
            &session.id,
            Event::model_text("Hel")
                .with_invocation("inv-1")
                .with_state_delta(state(json!({"draft": true})))
                .partial(),
        )
        .expect("partial");
    store
        .append_event_owned(
            &session.id,
            Event::model_text("Hello")
                .with_invocation("inv-1")
                .with_state_delta(state(json!({"final": true})))
                .turn_complete(),
        )
        .expect("final");

    let refreshed = store.get_session(&session.id).expect("get").expect("exists");
    assert_eq!(refreshed.state, state(json!({"final": true})));

    let raw = store
        .read_events(&session.id, None)
        .expect("cursor")
        .collect::<Result<Vec<_>, CodaError>>()
        .expect("events");
    assert_eq!(raw.len(), 2);
    assert!(raw[0].partial);

    let conversation = store.conversation_events(&session.id).expect("conversation");
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].text(), "Hello");
    assert!(conversation[0].turn_complete);
}

#[test]
fn functional_read_events_pages_in_append_order_and_resumes_after_since() {
    let temp = tempdir().expect("tempdir");
    let store = SessionStore::open_with_options(
        temp.path().join("sessions.sqlite"),
        SessionStoreOptions { event_page_size: 2 },
    )
    .expect("open");
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");

    let mut ids = Vec::new();
    for index in 0..5 {
        let event = store
            .append_event_owned(&session.id, Event::user_text(format!("message {index}")))
            .expect("append");
        ids.push(event.id);
    }

    let mut cursor = store.read_events(&session.id, None).expect("cursor");
    let first_three: Vec<String> = cursor
        .by_ref()
        .take(3)
        .map(|event| event.expect("event").id)
        .collect();
    assert_eq!(first_three, ids[..3].to_vec());
    let resume_from = cursor.last_event_id().expect("last id").to_string();
    assert_eq!(resume_from, ids[2]);

    let rest: Vec<String> = store
        .read_events(&session.id, Some(&resume_from))
        .expect("cursor")
        .map(|event| event.expect("event").id)
        .collect();
    assert_eq!(rest, ids[3..].to_vec());

    let all = store
        .read_events(&session.id, None)
        .expect("cursor")
        .collect::<Result<Vec<_>, CodaError>>()
        .expect("events");
    let timestamps: Vec<u64> = all.iter().map(|event| event.timestamp_ms).collect();
    assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn regression_read_events_rejects_unknown_since_and_session() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");

    let error = match store.read_events(&session.id, Some("evt-unknown")) {
        Ok(_) => panic!("unknown since id must fail"),
        Err(error) => error,
    };
    assert_eq!(error.code(), ErrorCode::InvalidInput);
    assert_eq!(error.context_value("event_id"), Some("evt-unknown"));

    let error = match store.read_events("ses-missing", None) {
        Ok(_) => panic!("unknown session must fail"),
        Err(error) => error,
    };
    assert_eq!(error.code(), ErrorCode::InvalidInput);
}

#[test]
fn regression_append_to_unknown_session_is_invalid_input() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let error = store
        .append_event_owned("ses-missing", Event::user_text("hello"))
        .expect_err("unknown session");
    assert_eq!(error.code(), ErrorCode::InvalidInput);
    assert_eq!(error.context_value("session_id"), Some("ses-missing"));
}

#[test]
fn functional_fault_hook_rolls_back_event_and_state_together() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");

    for failing_stage in [AppendStage::EventWritten, AppendStage::StateApplied] {
        let hook: AppendFaultHook = Arc::new(move |stage| {
            if stage == failing_stage {
                return Err(CodaError::internal("injected crash"));
            }
            Ok(())
        });
        store.set_append_fault_hook(Some(hook));

        let error = store
            .append_event_owned(
                &session.id,
                Event::user_text("boom")
                    .with_state_delta(state(json!({"app:x": 1, "user:y": 2, "z": 3}))),
            )
            .expect_err("hook must abort the append");
        assert!(error.message().contains("injected crash"));

        let events = store
            .read_events(&session.id, None)
            .expect("cursor")
            .collect::<Result<Vec<_>, CodaError>>()
            .expect("events");
        assert!(events.is_empty(), "event row must be rolled back");
        let layers = store.load_state_layers(&session.id).expect("layers");
        assert!(layers.app.is_empty());
        assert!(layers.user.is_empty());
        assert!(layers.session.is_empty());
        let unchanged = store.get_session(&session.id).expect("get").expect("exists");
        assert_eq!(unchanged.update_time_ms, session.update_time_ms);
    }

    store.set_append_fault_hook(None);
    store
        .append_event_owned(
            &session.id,
            Event::user_text("ok").with_state_delta(state(json!({"z": 3}))),
        )
        .expect("append after clearing hook");
    let layers = store.load_state_layers(&session.id).expect("layers");
    assert_eq!(layers.session, state(json!({"z": 3})));
}

#[test]
fn functional_delete_session_removes_events_and_rejects_unknown_ids() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");
    store
        .append_event_owned(&session.id, Event::user_text("hello"))
        .expect("append");

    store.delete_session(&session.id).expect("delete");
    assert!(store.get_session(&session.id).expect("get").is_none());
    assert!(store.list_sessions("coda", "alice").expect("list").is_empty());

    let error = store.delete_session(&session.id).expect_err("second delete");
    assert_eq!(error.code(), ErrorCode::InvalidInput);

    let recreated = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("name is free again");
    let events = store
        .read_events(&recreated.id, None)
        .expect("cursor")
        .count();
    assert_eq!(events, 0);
}

#[test]
fn functional_list_sessions_orders_by_recent_update_and_counts_events() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let alpha = store
        .create_session("coda", "alice", "alpha", CreateSessionOptions::default())
        .expect("alpha");
    let beta = store
        .create_session("coda", "alice", "beta", CreateSessionOptions::default())
        .expect("beta");
    store
        .create_session("coda", "bob", "gamma", CreateSessionOptions::default())
        .expect("other user");

    store
        .append_event_owned(&alpha.id, Event::user_text("one"))
        .expect("append");
    store
        .append_event_owned(&alpha.id, Event::model_text("two"))
        .expect("append");

    let summaries = store.list_sessions("coda", "alice").expect("list");
    let names: Vec<&str> = summaries.iter().map(|summary| summary.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(summaries[0].event_count, 2);
    assert_eq!(summaries[1].event_count, 0);
    assert_eq!(summaries[1].id, beta.id);
}

#[test]
fn integration_store_survives_reopen_with_tagged_event_content() {
    let temp = tempdir().expect("tempdir");
    let session_id = {
        let store = open_store(temp.path());
        let session = store
            .create_session("coda", "alice", "demo", CreateSessionOptions::default())
            .expect("create");
        store
            .append_event_owned(
                &session.id,
                Event::model(vec![EventPart::ToolCall {
                    id: "call_1".to_string(),
                    name: "list_directory".to_string(),
                    arguments: json!({"path": "."}),
                }])
                .with_invocation("inv-1"),
            )
            .expect("tool call");
        store
            .append_event_owned(
                &session.id,
                Event::tool_result("call_1", "list_directory", Some(json!({"files": []})), None)
                    .with_invocation("inv-1"),
            )
            .expect("tool result");
        session.id
    };

    let reopened = open_store(temp.path());
    let events = reopened.conversation_events(&session_id).expect("events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].author, EventAuthor::Model);
    assert_eq!(events[0].tool_call_ids(), vec![("call_1", "list_directory")]);
    assert_eq!(events[1].author, EventAuthor::Tool);
    assert_eq!(events[1].tool_result_ids(), vec!["call_1"]);

    let replay_again = reopened.conversation_events(&session_id).expect("events");
    assert_eq!(events, replay_again);
}

#[test]
fn regression_concurrent_appends_to_one_session_are_serialized() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(open_store(temp.path()));
    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            let session_id = session.id.clone();
            thread::spawn(move || {
                for index in 0..10 {
                    let key = format!("worker_{worker}");
                    store
                        .append_event_owned(
                            &session_id,
                            Event::user_text(format!("{worker}-{index}"))
                                .with_state_delta(state(json!({ key: index }))),
                        )
                        .expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }

    let events = store
        .read_events(&session.id, None)
        .expect("cursor")
        .collect::<Result<Vec<_>, CodaError>>()
        .expect("events");
    assert_eq!(events.len(), 40);
    assert!(events
        .windows(2)
        .all(|pair| pair[0].timestamp_ms <= pair[1].timestamp_ms));

    let refreshed = store.get_session(&session.id).expect("get").expect("exists");
    for worker in 0..4 {
        assert_eq!(refreshed.state[&format!("worker_{worker}")], json!(9));
    }
}
