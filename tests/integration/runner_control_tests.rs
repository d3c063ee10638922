//! Runner control channel against a real in-process runner.
//!
//! The agent is a shell script emitting canned `stream-json` output.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use agent_fleet::agent::process::QueryOptions;
use agent_fleet::ipc::{EventStream, RunnerClient};
use agent_fleet::models::event::StreamEvent;
use agent_fleet::models::message::MessageKind;
use agent_fleet::AppError;

use super::test_helpers::{
    sh_agent, InProcessRunner, ARGS_AGENT, FAILING_AGENT, REPLY_AGENT, SLOW_AGENT,
};

struct Fixture {
    client: RunnerClient,
    runner: InProcessRunner,
    _temp: TempDir,
}

async fn serve(script: &str) -> Fixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir: PathBuf = temp.path().join("data");
    let runner = InProcessRunner::launch("sess-1", &data_dir, sh_agent(script, temp.path()))
        .await
        .expect("runner launches");
    let client = RunnerClient::new(data_dir.join("runner.sock"));
    client.health().await.expect("runner healthy");
    Fixture {
        client,
        runner,
        _temp: temp,
    }
}

fn prompt(text: &str) -> QueryOptions {
    QueryOptions {
        prompt: text.into(),
        ..QueryOptions::default()
    }
}

/// Read until the terminal event, returning everything seen.
async fn drain(stream: &mut EventStream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("event within timeout")
            .expect("stream readable")
            .expect("stream open until terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn sequences(events: &[StreamEvent]) -> Vec<i64> {
    events.iter().filter_map(StreamEvent::sequence).collect()
}

#[tokio::test]
async fn query_streams_messages_then_done() {
    let fx = serve(REPLY_AGENT).await;

    let mut stream = fx.client.start(prompt("say hello")).await.expect("start");
    let events = drain(&mut stream).await;

    // The init banner is capability metadata and takes no sequence.
    assert_eq!(sequences(&events), vec![1, 2]);
    assert_eq!(events.last(), Some(&StreamEvent::done(false)));

    let kinds: Vec<MessageKind> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Message { message, .. } => Some(message.kind),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![MessageKind::Assistant, MessageKind::Result]);

    for event in &events {
        if let StreamEvent::Partial { partial } = event {
            assert_eq!(partial.sequence, 1, "preview targets the next slot");
        }
    }
}

#[tokio::test]
async fn status_and_commands_reflect_the_finished_query() {
    let fx = serve(REPLY_AGENT).await;
    let mut stream = fx.client.start(prompt("hi")).await.expect("start");
    drain(&mut stream).await;

    let status = fx.client.status().await.expect("status");
    assert!(!status.running);
    assert_eq!(status.last_sequence, 2);
    assert_eq!(status.supported_commands, vec!["/clear", "/compact"]);

    assert_eq!(
        fx.client.commands().await.expect("commands"),
        vec!["/clear", "/compact"]
    );

    let all = fx.client.messages_since(0).await.expect("messages");
    assert_eq!(all.len(), 2);
    let newer = fx.client.messages_since(1).await.expect("messages");
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].sequence, 2);
}

#[tokio::test]
async fn sequences_continue_across_queries() {
    let fx = serve(REPLY_AGENT).await;

    for _ in 0..2 {
        let mut stream = fx.client.start(prompt("again")).await.expect("start");
        drain(&mut stream).await;
    }

    let persisted: Vec<i64> = fx
        .runner
        .log
        .since("sess-1", 0)
        .await
        .expect("log")
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert_eq!(persisted, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn second_start_while_running_conflicts() {
    let fx = serve(SLOW_AGENT).await;

    let mut first = fx.client.start(prompt("wait")).await.expect("start");
    assert!(fx.runner.runner.is_running());

    match fx.client.start(prompt("again")).await {
        Err(AppError::Conflict(_)) => {}
        Err(other) => panic!("expected conflict, got {other:?}"),
        Ok(_) => panic!("expected conflict, got a stream"),
    }

    assert!(fx.client.interrupt().await.expect("interrupt"));
    let events = drain(&mut first).await;
    assert_eq!(events.last(), Some(&StreamEvent::done(true)));
    assert!(!fx.runner.runner.is_running());
}

#[tokio::test]
async fn interrupt_while_idle_returns_false() {
    let fx = serve(REPLY_AGENT).await;
    assert!(!fx.client.interrupt().await.expect("interrupt"));
}

#[tokio::test]
async fn agent_failure_ends_with_error_event() {
    let fx = serve(FAILING_AGENT).await;

    let mut stream = fx.client.start(prompt("go")).await.expect("start");
    let events = drain(&mut stream).await;

    match events.last() {
        Some(StreamEvent::Error { error }) => {
            assert!(error.contains("boom: bad credentials"), "{error}");
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(!fx.client.status().await.expect("status").running);

    // The runner accepts the next query.
    let mut retry = fx.client.start(prompt("again")).await.expect("restart");
    drain(&mut retry).await;
}

#[tokio::test]
async fn oversized_output_line_fails_the_query() {
    let fx = serve("head -c 8392704 /dev/zero | tr '\\0' x\necho\n").await;

    let mut stream = fx.client.start(prompt("go")).await.expect("start");
    let events = drain(&mut stream).await;

    match events.last() {
        Some(StreamEvent::Error { error }) => {
            assert!(error.contains("agent output for session sess-1"), "{error}");
            assert!(error.contains("bytes"), "{error}");
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(!fx.client.status().await.expect("status").running);
}

#[tokio::test]
async fn blank_prompt_is_rejected_before_spawning() {
    let fx = serve(REPLY_AGENT).await;

    match fx.client.start(prompt("   ")).await {
        Err(AppError::Validation(_)) => {}
        Err(other) => panic!("expected validation error, got {other:?}"),
        Ok(_) => panic!("expected validation error, got a stream"),
    }
    assert!(!fx.runner.runner.is_running());
}

#[tokio::test]
async fn subscribe_replays_after_cursor_then_follows_live() {
    let fx = serve(REPLY_AGENT).await;
    let mut stream = fx.client.start(prompt("one")).await.expect("start");
    drain(&mut stream).await;

    let mut subscription = fx.client.subscribe(1).await.expect("subscribe");
    let replayed = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("replay")
        .expect("readable")
        .expect("open");
    assert_eq!(replayed.sequence(), Some(2));

    let mut query = fx.client.start(prompt("two")).await.expect("start");
    drain(&mut query).await;

    let mut live = Vec::new();
    while live.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("live event")
            .expect("readable")
            .expect("open");
        if let Some(sequence) = event.sequence() {
            live.push(sequence);
        }
    }
    assert_eq!(live, vec![3, 4]);
}

#[tokio::test]
async fn recorded_conversation_is_resumed() {
    let fx = serve(ARGS_AGENT).await;

    let mut first = fx.client.start(prompt("first")).await.expect("start");
    let events = drain(&mut first).await;
    let args = first_assistant_args(&events);
    assert!(!args.contains("--resume"), "{args}");

    let mut second = fx.client.start(prompt("second")).await.expect("start");
    let events = drain(&mut second).await;
    let args = first_assistant_args(&events);
    assert!(args.contains("--resume conv-1"), "{args}");
}

#[tokio::test]
async fn explicit_resume_wins() {
    let fx = serve(ARGS_AGENT).await;

    let options = QueryOptions {
        resume: Some("conv-explicit".into()),
        ..prompt("go")
    };
    let mut stream = fx.client.start(options).await.expect("start");
    let events = drain(&mut stream).await;
    assert!(first_assistant_args(&events).contains("--resume conv-explicit"));
}

#[tokio::test]
async fn restarted_runner_resumes_from_its_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");

    let first = InProcessRunner::launch("sess-1", &data_dir, sh_agent(ARGS_AGENT, temp.path()))
        .await
        .expect("launch");
    let client = RunnerClient::new(data_dir.join("runner.sock"));
    let mut stream = client.start(prompt("first")).await.expect("start");
    drain(&mut stream).await;
    first.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _second = InProcessRunner::launch("sess-1", &data_dir, sh_agent(ARGS_AGENT, temp.path()))
        .await
        .expect("relaunch");
    let mut stream = client.start(prompt("second")).await.expect("start");
    let events = drain(&mut stream).await;

    assert_eq!(sequences(&events), vec![2]);
    assert!(first_assistant_args(&events).contains("--resume conv-1"));
}

fn first_assistant_args(events: &[StreamEvent]) -> String {
    events
        .iter()
        .find_map(|event| match event {
            StreamEvent::Message { message, .. } if message.kind == MessageKind::Assistant => {
                message.content["args"].as_str().map(str::to_owned)
            }
            _ => None,
        })
        .expect("assistant message with args")
}
