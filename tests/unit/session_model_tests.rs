use agent_fleet::models::session::{Session, SessionStatus, CLONING_MESSAGE};

const ALL: [SessionStatus; 5] = [
    SessionStatus::Creating,
    SessionStatus::Running,
    SessionStatus::Stopped,
    SessionStatus::Error,
    SessionStatus::Archived,
];

#[test]
fn new_session_starts_creating_while_cloning() {
    let session = Session::new(
        "Hello-World".into(),
        "octocat/Hello-World".into(),
        "main".into(),
        Some("say hi".into()),
    );

    assert_eq!(session.status, SessionStatus::Creating);
    assert_eq!(session.status_message.as_deref(), Some(CLONING_MESSAGE));
    assert!(session.container_id.is_none());
    assert_eq!(session.created_at, session.updated_at);
    assert!(!session.id.is_empty());
}

#[test]
fn generated_ids_are_unique() {
    let a = Session::new("a".into(), "o/a".into(), "main".into(), None);
    let b = Session::new("a".into(), "o/a".into(), "main".into(), None);
    assert_ne!(a.id, b.id);
}

#[test]
fn archived_is_terminal() {
    for next in ALL {
        assert!(!SessionStatus::Archived.allows(next), "archived -> {next}");
    }
}

#[test]
fn every_live_state_may_be_archived() {
    for status in ALL.into_iter().filter(|s| *s != SessionStatus::Archived) {
        assert!(status.allows(SessionStatus::Archived), "{status} -> archived");
    }
}

#[test]
fn transition_table() {
    use SessionStatus::{Archived, Creating, Error, Running, Stopped};

    let allowed = [
        (Creating, Running),
        (Creating, Error),
        (Running, Stopped),
        (Running, Error),
        (Stopped, Running),
        (Stopped, Error),
        (Error, Running),
        (Error, Stopped),
    ];
    for from in ALL {
        for to in ALL {
            let expected = (to == Archived && from != Archived) || allowed.contains(&(from, to));
            assert_eq!(from.allows(to), expected, "{from} -> {to}");
        }
    }
}

#[test]
fn status_round_trips_through_text() {
    for status in ALL {
        let parsed: SessionStatus = status.as_str().parse().expect("parse");
        assert_eq!(parsed, status);
        assert_eq!(
            serde_json::to_value(status).expect("json"),
            serde_json::Value::String(status.to_string())
        );
    }
    assert!("paused".parse::<SessionStatus>().is_err());
}

#[test]
fn session_serializes_camel_case() {
    let session = Session::new("n".into(), "o/n".into(), "dev".into(), None);
    let value = serde_json::to_value(&session).expect("json");

    assert_eq!(value["repoUrl"], "o/n");
    assert_eq!(value["status"], "creating");
    assert_eq!(value["statusMessage"], CLONING_MESSAGE);
    assert!(value["containerId"].is_null());
}
