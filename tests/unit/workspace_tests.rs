use agent_fleet::models::session::Session;
use agent_fleet::orchestrator::workspace::{resolve_clone_url, GitWorkspaces, WorkspaceProvider};
use agent_fleet::AppError;

const FORGE: &str = "https://github.com";

#[test]
fn shorthand_expands_against_forge() {
    assert_eq!(
        resolve_clone_url(FORGE, "octocat/Hello-World").expect("url"),
        "https://github.com/octocat/Hello-World.git"
    );
    assert_eq!(
        resolve_clone_url("https://git.example.com/", "team/repo.git").expect("url"),
        "https://git.example.com/team/repo.git"
    );
}

#[test]
fn full_references_pass_through() {
    for repo in [
        "https://github.com/octocat/Hello-World.git",
        "ssh://git@example.com/team/repo.git",
        "git@github.com:octocat/Hello-World.git",
        "/srv/git/local.git",
    ] {
        assert_eq!(resolve_clone_url(FORGE, repo).expect("url"), repo);
    }
}

#[test]
fn malformed_references_are_rejected() {
    for repo in ["", "   ", "just-a-name", "a/b/c", "owner/", "own er/repo", "-o/x;y"] {
        match resolve_clone_url(FORGE, repo) {
            Err(AppError::Validation(_)) => {}
            other => panic!("expected validation error for {repo:?}, got {other:?}"),
        }
    }
}

#[test]
fn option_shaped_references_are_rejected() {
    for repo in [
        "--upload-pack=touch /tmp/owned;://x",
        " -c core.sshCommand=sh://host/repo",
        "--config=x/y",
    ] {
        match resolve_clone_url(FORGE, repo) {
            Err(AppError::Validation(message)) => {
                assert!(message.contains("must not start with '-'"), "{message}");
            }
            other => panic!("expected validation error for {repo:?}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn option_shaped_reference_never_reaches_git() {
    let temp = tempfile::tempdir().expect("tempdir");
    let marker = temp.path().join("owned");
    let mut session = Session::new(
        "evil".into(),
        format!("--upload-pack=touch {};://x", marker.display()),
        "main".into(),
        None,
    );
    session.workspace_path = temp.path().join("checkout").display().to_string();

    match GitWorkspaces::new(FORGE).prepare(&session).await {
        Err(AppError::Validation(_)) => {}
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(!marker.exists());
    assert!(!temp.path().join("checkout").exists());
}
