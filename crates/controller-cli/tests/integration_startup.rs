//! Integration tests for the daemon binary's startup-time failure paths.
//!
//! These only exercise the fast-fail branch in `main` (config load before
//! any network activity) — the long-poll loop itself needs a live Telegram
//! bot token and is covered at the unit level inside each crate instead.

use std::process::Command;

fn controller_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_telegram-controller"))
}

#[test]
fn missing_bot_token_exits_nonzero() {
    let output = controller_command()
        .env_remove("TELEGRAM_BOT_TOKEN")
        .env_remove("TELEGRAM_CONTROLLER_STATE_DIR")
        .arg("--config")
        .arg("/nonexistent/config-that-does-not-exist.yml")
        .output()
        .expect("failed to spawn telegram-controller binary");

    assert!(!output.status.success(), "expected a nonzero exit code when TELEGRAM_BOT_TOKEN is unset");
    // tracing_subscriber's fmt layer defaults to stdout.
    let logged = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        logged.contains("TELEGRAM_BOT_TOKEN") || logged.contains("failed to load configuration"),
        "expected the missing-token error to be logged, got: {logged}"
    );
}

#[test]
fn unknown_flag_is_rejected_by_clap() {
    let output = controller_command()
        .arg("--not-a-real-flag")
        .output()
        .expect("failed to spawn telegram-controller binary");

    assert!(!output.status.success());
}
