use agent_fleet::AppError;

fn all_variants() -> Vec<AppError> {
    vec![
        AppError::Config("c".into()),
        AppError::Db("d".into()),
        AppError::Validation("v".into()),
        AppError::Conflict("k".into()),
        AppError::NotFound("n".into()),
        AppError::Runtime("r".into()),
        AppError::Workspace("w".into()),
        AppError::Agent("a".into()),
        AppError::Ipc("i".into()),
        AppError::Io("o".into()),
    ]
}

#[test]
fn codes_survive_the_wire() {
    for err in all_variants() {
        let rebuilt = AppError::from_code(err.code(), err.message().to_owned());
        assert_eq!(rebuilt.code(), err.code());
        assert_eq!(rebuilt.message(), err.message());
        assert_eq!(rebuilt.to_string(), err.to_string());
    }
}

#[test]
fn unknown_code_becomes_ipc() {
    let err = AppError::from_code("mystery", "lost".into());
    assert!(matches!(err, AppError::Ipc(ref msg) if msg == "lost"));
}

#[test]
fn display_prefixes_category() {
    assert_eq!(
        AppError::NotFound("session x".into()).to_string(),
        "not found: session x"
    );
    assert_eq!(
        AppError::Conflict("busy".into()).to_string(),
        "conflict: busy"
    );
}

#[test]
fn only_transient_categories_are_retryable() {
    let retryable: Vec<&str> = all_variants()
        .iter()
        .filter(|err| err.is_retryable())
        .map(AppError::code)
        .collect();
    assert_eq!(retryable, vec!["conflict", "runtime", "ipc"]);
}

#[test]
fn io_and_json_errors_convert() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(io, AppError::Io(_)));

    let json: AppError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(matches!(json, AppError::Ipc(ref msg) if msg.starts_with("invalid json")));
}

#[test]
fn engine_not_found_maps_to_not_found() {
    let err: AppError = bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        message: "No such container: abc".into(),
    }
    .into();
    assert!(matches!(err, AppError::NotFound(_)));

    let err: AppError = bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: "daemon exploded".into(),
    }
    .into();
    assert!(matches!(err, AppError::Runtime(_)));
}
