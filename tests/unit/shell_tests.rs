use agent_fleet::runtime::{shell_join, shell_quote};

#[test]
fn plain_words_are_not_quoted() {
    assert_eq!(shell_quote("agent-fleet-runner"), "agent-fleet-runner");
    assert_eq!(shell_quote("/fleet/runner.sock"), "/fleet/runner.sock");
    assert_eq!(shell_quote("--session-id=abc"), "--session-id=abc");
}

#[test]
fn special_characters_are_single_quoted() {
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("two words"), "'two words'");
    assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn join_quotes_each_argument() {
    let cmd = vec![
        "agent-fleet-runner".to_owned(),
        "--agent-arg".to_owned(),
        "--append-system-prompt".to_owned(),
        "--agent-arg".to_owned(),
        "be nice; ok".to_owned(),
    ];
    assert_eq!(
        shell_join(&cmd),
        "agent-fleet-runner --agent-arg --append-system-prompt --agent-arg 'be nice; ok'"
    );
}
