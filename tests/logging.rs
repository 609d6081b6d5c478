//! Subscriber installation runs in its own test binary so the global
//! dispatcher does not leak into other tests.

#![allow(clippy::expect_used)]

use session_net::config::LoggingConfig;
use session_net::utils::logging::init_logging;
use tracing::Level;

#[test]
fn test_init_logging_installs_once() {
    let config = LoggingConfig {
        app_name: "session-net-test".into(),
        log_level: Level::DEBUG,
        json_format: true,
    };
    init_logging(&config).expect("first install succeeds");

    let err = init_logging(&config).expect_err("second install fails");
    assert!(err.to_string().contains("Failed to install logger"));
}
