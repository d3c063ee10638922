//! Session lifecycle through the manager, against the fake engine and a
//! real in-process runner.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;

use agent_fleet::agent::process::QueryOptions;
use agent_fleet::models::message::MessageRange;
use agent_fleet::models::session::{SessionStatus, CLONING_MESSAGE};
use agent_fleet::orchestrator::lifecycle::STARTING_MESSAGE;
use agent_fleet::orchestrator::CreateSession;
use agent_fleet::runtime::ContainerState;
use agent_fleet::AppError;

use super::test_helpers::{
    eventually, status_of, FakeWorkspaces, Harness, FAKE_RUNNER_PID, REPLY_AGENT, SLOW_AGENT,
};

fn prompt(text: &str) -> QueryOptions {
    QueryOptions {
        prompt: text.into(),
        ..QueryOptions::default()
    }
}

async fn message_count(h: &Harness, session_id: &str) -> usize {
    h.manager
        .messages(session_id, MessageRange::default())
        .await
        .expect("messages")
        .messages
        .len()
}

#[tokio::test]
async fn create_provisions_to_running() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let mut updates = h.manager.dispatcher().subscribe_updates();

    let provisioning = h
        .manager
        .create_session(CreateSession {
            repo_url: "octocat/Hello-World".into(),
            ..CreateSession::default()
        })
        .await
        .expect("create");

    let created = provisioning.session.clone();
    assert_eq!(created.status, SessionStatus::Creating);
    assert_eq!(created.status_message.as_deref(), Some(CLONING_MESSAGE));
    assert_eq!(created.name, "Hello-World");
    assert_eq!(created.branch, "main");
    assert_eq!(
        created.workspace_path,
        h.config.session_workspace_dir(&created.id).display().to_string()
    );

    let running = provisioning
        .task
        .await
        .expect("join")
        .expect("provisioned");
    assert_eq!(running.status, SessionStatus::Running);
    assert!(running.status_message.is_none());
    let container_id = running.container_id.clone().expect("container id");
    assert_eq!(h.runtime.state_of(&container_id), ContainerState::Running);
    assert_eq!(h.runtime.count("create"), 1);
    assert_eq!(h.runtime.count("exec_detached"), 1);
    assert_eq!(h.workspaces.prepared(), vec![created.id.clone()]);
    assert!(h.manager.runners().is_attached(&created.id, &container_id));
    assert_eq!(h.manager.runners().pid(&created.id), Some(FAKE_RUNNER_PID));

    let mut seen = Vec::new();
    while let Ok(session) = updates.try_recv() {
        seen.push((session.status, session.status_message));
    }
    assert_eq!(
        seen,
        vec![
            (SessionStatus::Creating, Some(CLONING_MESSAGE.to_owned())),
            (SessionStatus::Creating, Some(STARTING_MESSAGE.to_owned())),
            (SessionStatus::Running, None),
        ]
    );
}

#[tokio::test]
async fn initial_prompt_is_delivered_once_running() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h
        .provisioned("octocat/Hello-World", Some("Describe the repo"))
        .await;
    assert_eq!(session.initial_prompt.as_deref(), Some("Describe the repo"));

    eventually("initial prompt answered", || async {
        (message_count(&h, &session.id).await == 2).then_some(())
    })
    .await;
}

#[tokio::test]
async fn prompt_events_reach_orchestrator_subscribers() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", None).await;
    let mut subscription = h
        .manager
        .dispatcher()
        .subscribe(&session.id, 0, None)
        .await
        .expect("subscribe");

    // The relay subscribes asynchronously after attach.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let ack = h
        .manager
        .send_prompt(&session.id, prompt("hello"))
        .await
        .expect("prompt");
    assert_eq!(ack["started"], true);
    assert_eq!(ack["lastSequence"], 0);

    let mut sequences = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("relayed event")
            .expect("subscription open");
        if let Some(sequence) = event.sequence() {
            sequences.push(sequence);
        }
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(sequences, vec![1, 2]);

    let page = h
        .manager
        .messages(&session.id, MessageRange::after(0, 10))
        .await
        .expect("messages");
    assert_eq!(page.messages.len(), 2);
    assert!(!page.has_more);

    assert_eq!(
        h.manager.commands(&session.id).await.expect("commands"),
        vec!["/clear", "/compact"]
    );
}

#[tokio::test]
async fn stop_is_idempotent_and_start_relaunches() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", None).await;
    let container_id = session.container_id.clone().expect("container");

    let stopped = h.manager.stop_session(&session.id).await.expect("stop");
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert_eq!(stopped.container_id.as_deref(), Some(container_id.as_str()));
    assert_eq!(h.runtime.state_of(&container_id), ContainerState::Stopped);
    assert!(!h.manager.runners().is_attached(&session.id, &container_id));

    let again = h.manager.stop_session(&session.id).await.expect("stop again");
    assert_eq!(again.status, SessionStatus::Stopped);
    assert_eq!(h.runtime.count("stop"), 1);

    let restarted = h.manager.start_session(&session.id).await.expect("start");
    assert_eq!(restarted.status, SessionStatus::Running);
    assert_eq!(restarted.container_id.as_deref(), Some(container_id.as_str()));
    assert_eq!(h.runtime.count("create"), 1, "existing container reused");
    assert_eq!(h.runtime.count("exec_detached"), 2);

    let starts = h.runtime.count("start");
    let unchanged = h.manager.start_session(&session.id).await.expect("start again");
    assert_eq!(unchanged.status, SessionStatus::Running);
    assert_eq!(h.runtime.count("start"), starts, "running session untouched");
}

#[tokio::test]
async fn start_recreates_a_vanished_container() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", None).await;
    let old = session.container_id.clone().expect("container");

    h.manager.stop_session(&session.id).await.expect("stop");
    h.runtime.vanish(&old);

    let restarted = h.manager.start_session(&session.id).await.expect("start");
    let new = restarted.container_id.expect("container");
    assert_ne!(new, old);
    assert_eq!(h.runtime.state_of(&new), ContainerState::Running);
}

#[tokio::test]
async fn archive_releases_resources_and_keeps_history() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", Some("hi")).await;
    let container_id = session.container_id.clone().expect("container");
    eventually("initial prompt answered", || async {
        (message_count(&h, &session.id).await == 2).then_some(())
    })
    .await;

    let archived = h.manager.archive_session(&session.id).await.expect("archive");
    assert_eq!(archived.status, SessionStatus::Archived);
    assert!(!h.runtime.exists(&container_id));
    assert_eq!(
        h.workspaces.released(),
        vec![Path::new(&session.workspace_path).to_path_buf()]
    );
    assert!(h.manager.runners().attached().is_empty());

    let removes = h.runtime.count("remove");
    let again = h.manager.archive_session(&session.id).await.expect("archive again");
    assert_eq!(again.status, SessionStatus::Archived);
    assert_eq!(h.runtime.count("remove"), removes);

    assert_eq!(message_count(&h, &session.id).await, 2, "history retained");

    assert!(matches!(
        h.manager.start_session(&session.id).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        h.manager.stop_session(&session.id).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        h.manager.send_prompt(&session.id, prompt("more")).await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn failed_clone_leaves_session_in_error() {
    let h = Harness::with_workspaces(Some(REPLY_AGENT), FakeWorkspaces::failing()).await;

    let session = h.provisioned("octocat/Missing", None).await;

    assert_eq!(session.status, SessionStatus::Error);
    let message = session.status_message.expect("error message");
    assert!(message.contains("repository not found"), "{message}");
    assert!(session.container_id.is_none());
    assert_eq!(h.runtime.count("create"), 0);

    // An errored session may still be archived.
    let archived = h.manager.archive_session(&session.id).await.expect("archive");
    assert_eq!(archived.status, SessionStatus::Archived);
}

#[tokio::test]
async fn stalled_clone_times_out_and_frees_the_session() {
    let h = Harness::with_workspaces(Some(REPLY_AGENT), FakeWorkspaces::hanging()).await;

    let session = h.provisioned("octocat/Slow", None).await;

    assert_eq!(session.status, SessionStatus::Error);
    let message = session.status_message.expect("error message");
    assert!(message.contains("timed out after 2s"), "{message}");
    assert_eq!(h.runtime.count("create"), 0);

    let archived = tokio::time::timeout(
        Duration::from_secs(2),
        h.manager.archive_session(&session.id),
    )
    .await
    .expect("archive does not wait on the clone")
    .expect("archive");
    assert_eq!(archived.status, SessionStatus::Archived);
}

#[tokio::test]
async fn malformed_requests_create_nothing() {
    let h = Harness::new(Some(REPLY_AGENT)).await;

    for request in [
        CreateSession {
            repo_url: "not a repository".into(),
            ..CreateSession::default()
        },
        CreateSession {
            repo_url: "octocat/Hello-World".into(),
            branch: Some("--upload-pack=evil".into()),
            ..CreateSession::default()
        },
        CreateSession {
            repo_url: "octocat/Hello-World".into(),
            branch: Some("two words".into()),
            ..CreateSession::default()
        },
    ] {
        assert!(matches!(
            h.manager.create_session(request).await,
            Err(AppError::Validation(_))
        ));
    }
    assert!(h.manager.list_sessions().await.expect("list").is_empty());
}

#[tokio::test]
async fn custom_name_and_branch_are_kept() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let provisioning = h
        .manager
        .create_session(CreateSession {
            name: Some("  demo  ".into()),
            repo_url: "https://github.com/octocat/Hello-World.git".into(),
            branch: Some("dev".into()),
            initial_prompt: Some("   ".into()),
        })
        .await
        .expect("create");

    assert_eq!(provisioning.session.name, "demo");
    assert_eq!(provisioning.session.branch, "dev");
    assert!(provisioning.session.initial_prompt.is_none());
    provisioning.task.await.expect("join").expect("provisioned");
}

#[tokio::test]
async fn prompts_require_a_running_session() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", None).await;

    assert!(matches!(
        h.manager.send_prompt(&session.id, prompt("  ")).await,
        Err(AppError::Validation(_))
    ));

    h.manager.stop_session(&session.id).await.expect("stop");
    assert!(matches!(
        h.manager.send_prompt(&session.id, prompt("hello")).await,
        Err(AppError::Conflict(_))
    ));
    assert!(!h.manager.interrupt(&session.id).await.expect("interrupt"));
}

#[tokio::test]
async fn interrupt_reaches_the_running_query() {
    let h = Harness::new(Some(SLOW_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", None).await;
    let container_id = session.container_id.clone().expect("container");

    assert!(!h.manager.interrupt(&session.id).await.expect("idle interrupt"));

    h.manager
        .send_prompt(&session.id, prompt("take your time"))
        .await
        .expect("prompt");
    let runner = h.runtime.runner(&container_id).expect("runner alive");
    assert!(runner.is_running());

    match h.manager.send_prompt(&session.id, prompt("again")).await {
        Err(AppError::Conflict(_)) => {}
        other => panic!("expected conflict, got {other:?}"),
    }

    assert!(h.manager.interrupt(&session.id).await.expect("interrupt"));
    tokio::time::timeout(Duration::from_secs(5), runner.wait_idle())
        .await
        .expect("agent stops");
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let h = Harness::new(None).await;

    assert!(matches!(
        h.manager.get_session("ghost").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.start_session("ghost").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.stop_session("ghost").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.archive_session("ghost").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.messages("ghost", MessageRange::default()).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn runner_log_reads_from_a_line() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let session = h.provisioned("octocat/Hello-World", None).await;

    let mut output = h
        .manager
        .runner_log(&session.id, 2, false)
        .await
        .expect("runner log");
    let mut text = Vec::new();
    while let Some(chunk) = output.next().await {
        text.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(
        String::from_utf8(text).expect("utf8"),
        "control server listening\nready\n"
    );

    let mut followed = h
        .manager
        .runner_log(&session.id, 3, true)
        .await
        .expect("follow");
    let first = followed.next().await.expect("line").expect("chunk");
    assert_eq!(&first[..], b"ready\n");
}

#[tokio::test]
async fn sessions_are_listed_newest_first() {
    let h = Harness::new(Some(REPLY_AGENT)).await;
    let first = h.provisioned("octocat/one", None).await;
    let second = h.provisioned("octocat/two", None).await;

    let listed: Vec<String> = h
        .manager
        .list_sessions()
        .await
        .expect("list")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(listed, vec![second.id, first.id]);
    assert_eq!(status_of(&h.manager, &listed[0]).await, SessionStatus::Running);
}
