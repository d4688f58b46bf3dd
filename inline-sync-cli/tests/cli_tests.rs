use clap::Parser;
use inline_sync_cli::{Args, Command, STORE_FILE, open_store, parse_command};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn parse(argv: &[&str]) -> Args {
    Args::try_parse_from(std::iter::once("inline-sync").chain(argv.iter().copied())).unwrap()
}

// ── Arguments ────────────────────────────────────────────────────

#[test]
fn explicit_arguments_override_defaults() {
    let args = parse(&[
        "--url",
        "ws://127.0.0.1:8000/realtime",
        "--token",
        "secret",
        "--data-dir",
        "/tmp/inline-test",
        "-v",
    ]);
    assert_eq!(args.url.as_str(), "ws://127.0.0.1:8000/realtime");
    assert_eq!(args.token.as_deref(), Some("secret"));
    assert_eq!(args.store_path(), std::path::Path::new("/tmp/inline-test").join(STORE_FILE));
    assert!(args.verbose);
}

#[test]
fn url_is_required() {
    // SAFETY: no other test in this binary reads the variable.
    unsafe { std::env::remove_var("INLINE_REALTIME_URL") };
    let result = Args::try_parse_from(["inline-sync", "--token", "secret"]);
    assert!(result.is_err());
}

#[test]
fn invalid_url_is_rejected() {
    let result = Args::try_parse_from(["inline-sync", "--url", "not a url"]);
    assert!(result.is_err());
}

#[test]
fn config_file_overrides_engine_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, r#"{ "connection": { "ping_interval_ms": 2000 } }"#).unwrap();

    let args = parse(&["--url", "ws://localhost/", "--config", path.to_str().unwrap()]);
    let config = args.load_config().unwrap();
    assert_eq!(config.connection.ping_interval(), Duration::from_secs(2));

    let missing = parse(&["--url", "ws://localhost/", "--config", "/nonexistent/engine.json"]);
    assert!(missing.load_config().is_err());
}

#[tokio::test]
async fn store_is_created_inside_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("nested").join("data");
    open_store(&data_dir).unwrap();
    assert!(data_dir.join(STORE_FILE).exists());
}

// ── Commands ─────────────────────────────────────────────────────

#[test]
fn commands_parse() {
    assert_eq!(parse_command("token abc"), Some(Command::Token("abc".into())));
    assert_eq!(parse_command("  bg "), Some(Command::Background));
    assert_eq!(parse_command("foreground"), Some(Command::Foreground));
    assert_eq!(parse_command("offline"), Some(Command::Offline));
    assert_eq!(parse_command("probe"), Some(Command::Probe));
    assert_eq!(parse_command("status"), Some(Command::Status));
    assert_eq!(parse_command("logout"), Some(Command::Logout));
}

#[test]
fn malformed_commands_are_rejected() {
    assert_eq!(parse_command(""), None);
    assert_eq!(parse_command("token"), None);
    assert_eq!(parse_command("token a b"), None);
    assert_eq!(parse_command("probe now"), None);
    assert_eq!(parse_command("reconnect"), None);
}
