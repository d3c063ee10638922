//! Relaying a runner's control stream into the orchestrator dispatcher.

use std::time::Duration;

use serde_json::json;

use agent_fleet::agent::process::QueryOptions;
use agent_fleet::events::{Dispatcher, Subscription};
use agent_fleet::models::event::{PartialMessage, StreamEvent};
use agent_fleet::orchestrator::logs::LogStore;
use agent_fleet::orchestrator::runners::RunnerRegistry;

use super::test_helpers::{eventually, sh_agent, InProcessRunner, REPLY_AGENT};

const SESSION: &str = "sess-1";

/// Everything `sub` yields up to and including the terminal event.
async fn until_terminal(sub: &mut Subscription) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("event within timeout")
            .expect("subscription open");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn lagging_relay_reconnects_without_failing_the_stream() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_root = temp.path().join("data");
    let runner = InProcessRunner::launch_with_buffer(
        SESSION,
        &data_root.join(SESSION),
        sh_agent(REPLY_AGENT, temp.path()),
        8,
    )
    .await
    .expect("runner launches");

    let dispatcher = Dispatcher::new(64);
    let registry = RunnerRegistry::new(
        dispatcher.clone(),
        LogStore::new(&data_root),
        &data_root,
    );
    registry.attach(SESSION, "container-1", None);
    eventually("relay subscribed", || async {
        (runner.dispatcher.subscriber_count(SESSION) == 1).then_some(())
    })
    .await;

    let mut watcher = dispatcher.subscribe_live(SESSION);

    // More than the relay's buffer in one go.
    for n in 0..32 {
        runner.dispatcher.publish(
            SESSION,
            &StreamEvent::Partial {
                partial: PartialMessage {
                    sequence: 1,
                    content: json!({ "text": format!("chunk {n}") }),
                },
            },
        );
    }
    assert_eq!(runner.dispatcher.subscriber_count(SESSION), 0);
    eventually("relay reconnected", || async {
        (runner.dispatcher.subscriber_count(SESSION) == 1).then_some(())
    })
    .await;

    drop(
        runner
            .runner
            .start(QueryOptions {
                prompt: "hello".into(),
                ..QueryOptions::default()
            })
            .await
            .expect("start"),
    );
    let events = until_terminal(&mut watcher).await;

    let sequences: Vec<i64> = events.iter().filter_map(StreamEvent::sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(events.last(), Some(&StreamEvent::done(false)));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, StreamEvent::Error { .. } | StreamEvent::Lagged { .. })),
        "{events:?}"
    );
    assert!(registry.is_attached(SESSION, "container-1"));
    registry.shutdown();
}
