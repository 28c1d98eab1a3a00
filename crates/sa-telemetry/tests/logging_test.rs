use sa_telemetry::logging;

#[test]
fn test_init_logging_human() {
    // Should not panic; second call is a safe no-op.
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // The global subscriber may already be set by another test; this must
    // silently no-op in that case.
    logging::init_logging_json("test-service-json", "info");

    tracing::info!(key = "value", "json log line");
}

#[test]
fn test_file_logging_creates_runner_log() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");

    let guard = logging::init_logging_with_file("file-test", "info", &logs).unwrap();
    drop(guard);

    assert!(logs.is_dir());
    assert!(logs.join(logging::RUNNER_LOG).exists());
}
