use std::{collections::BTreeMap, fs};

use coda_core::{CancellationToken, ErrorCode};
use coda_session::{CreateSessionOptions, Event, EventAuthor, EventPart, SessionStore};
use coda_tools::{register_builtin_tools, ToolContext, ToolPolicy, ToolRegistry};
use serde_json::{json, Value};
use tempfile::tempdir;

fn state(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn integration_demo_session_records_tool_round_trip_in_order() {
    let temp = tempdir().expect("tempdir");
    let workspace = temp.path().join("workspace");
    fs::create_dir_all(&workspace).expect("workspace");
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(workspace.join(name), name).expect("write fixture");
    }

    let store = SessionStore::open(temp.path().join("sessions.sqlite")).expect("open store");
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, ToolPolicy::new(&workspace)).expect("register");

    let session = store
        .create_session("coda", "alice", "demo", CreateSessionOptions::default())
        .expect("create");
    let mut update_times = vec![session.update_time_ms];
    let mut record_update_time = |store: &SessionStore| {
        let current = store
            .get_session(&session.id)
            .expect("get")
            .expect("session exists");
        update_times.push(current.update_time_ms);
    };

    store
        .append_event_owned(&session.id, Event::user_text("list files"))
        .expect("append user");
    record_update_time(&store);

    store
        .append_event_owned(
            &session.id,
            Event::model(vec![EventPart::ToolCall {
                id: "call-1".to_string(),
                name: "list_directory".to_string(),
                arguments: json!({ "path": "." }),
            }]),
        )
        .expect("append tool call");
    record_update_time(&store);

    let output = registry
        .invoke(
            "list_directory",
            json!({ "path": "." }),
            ToolContext::new(&workspace).with_cancellation(CancellationToken::new()),
        )
        .await
        .expect("list_directory succeeds");
    assert_eq!(output["count"], 3);

    store
        .append_event_owned(
            &session.id,
            Event::tool_result("call-1", "list_directory", Some(output), None),
        )
        .expect("append tool result");
    record_update_time(&store);

    store
        .append_event_owned(
            &session.id,
            Event::model_text("found 3 files").turn_complete(),
        )
        .expect("append final");
    record_update_time(&store);

    let events = store
        .read_events(&session.id, None)
        .expect("read")
        .collect::<Result<Vec<_>, _>>()
        .expect("events decode");
    assert_eq!(events.len(), 4);
    let authors: Vec<EventAuthor> = events.iter().map(|event| event.author).collect();
    assert_eq!(
        authors,
        vec![
            EventAuthor::User,
            EventAuthor::Model,
            EventAuthor::Tool,
            EventAuthor::Model
        ]
    );
    assert_eq!(events[0].text(), "list files");
    assert_eq!(events[1].tool_call_ids(), vec![("call-1", "list_directory")]);
    assert_eq!(events[2].tool_result_ids(), vec!["call-1"]);
    assert_eq!(events[3].text(), "found 3 files");
    assert!(events[3].turn_complete);

    assert!(
        update_times.windows(2).all(|pair| pair[0] <= pair[1]),
        "update times must advance monotonically: {update_times:?}"
    );
    assert!(events
        .windows(2)
        .all(|pair| pair[0].timestamp_ms <= pair[1].timestamp_ms));
}

#[test]
fn integration_state_layers_merge_across_sessions_of_the_same_user() {
    let temp = tempdir().expect("tempdir");
    let store = SessionStore::open(temp.path().join("sessions.sqlite")).expect("open store");
    let first = store
        .create_session("coda", "alice", "first", CreateSessionOptions::default())
        .expect("create first");
    store
        .append_event_owned(
            &first.id,
            Event::user_text("remember things").with_state_delta(state(&[
                ("app:a", json!(1)),
                ("user:a", json!(2)),
                ("user:b", json!(3)),
                ("b", json!(4)),
                ("temp:scratch", json!("dropped")),
            ])),
        )
        .expect("append");

    let merged = store
        .get_session(&first.id)
        .expect("get")
        .expect("exists")
        .state;
    assert_eq!(merged, state(&[("a", json!(2)), ("b", json!(4))]));

    let second = store
        .create_session("coda", "alice", "second", CreateSessionOptions::default())
        .expect("create second");
    assert_eq!(second.state, state(&[("a", json!(2)), ("b", json!(3))]));

    let other_user = store
        .create_session("coda", "bob", "first", CreateSessionOptions::default())
        .expect("create other user");
    assert_eq!(other_user.state, state(&[("a", json!(1))]));

    let persisted = store
        .read_events(&first.id, None)
        .expect("read")
        .next()
        .expect("one event")
        .expect("decode");
    assert!(!persisted.state_delta.contains_key("temp:scratch"));
}

#[test]
fn integration_replay_is_idempotent() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("sessions.sqlite");
    let session_id = {
        let store = SessionStore::open(&path).expect("open store");
        let session = store
            .create_session("coda", "alice", "demo", CreateSessionOptions::default())
            .expect("create");
        store
            .append_event_owned(
                &session.id,
                Event::user_text("hi").with_state_delta(state(&[("goal", json!("ship"))])),
            )
            .expect("append user");
        store
            .append_event_owned(&session.id, Event::model_text("par").partial())
            .expect("append partial");
        store
            .append_event_owned(&session.id, Event::model_text("partial done").turn_complete())
            .expect("append final");
        session.id
    };

    let reopened = SessionStore::open(&path).expect("reopen store");
    let first_events = reopened.conversation_events(&session_id).expect("replay");
    let second_events = reopened.conversation_events(&session_id).expect("replay");
    assert_eq!(first_events, second_events);
    assert_eq!(first_events.len(), 2);
    assert!(first_events.iter().all(|event| !event.partial));

    let first_state = reopened.get_session(&session_id).expect("get").expect("exists");
    let second_state = reopened.get_session(&session_id).expect("get").expect("exists");
    assert_eq!(first_state.state, second_state.state);
    assert_eq!(first_state.state.get("goal"), Some(&json!("ship")));
}

#[tokio::test]
async fn regression_tool_errors_carry_taxonomy_codes_through_the_registry() {
    let temp = tempdir().expect("tempdir");
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, ToolPolicy::new(temp.path())).expect("register");

    let error = registry
        .invoke(
            "read_file",
            json!({ "path": "../outside.txt" }),
            ToolContext::new(temp.path()),
        )
        .await
        .expect_err("traversal must fail");
    assert!(error.is(ErrorCode::PathTraversal));

    let duplicate = register_builtin_tools(&mut registry, ToolPolicy::new(temp.path()))
        .expect_err("second registration must fail");
    assert!(duplicate.is(ErrorCode::InvalidInput));
    assert_eq!(registry.len(), coda_tools::builtin_tool_names().len());
}
