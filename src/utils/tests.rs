use super::error::{ReceiveError, StartupError, SubscriptionError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // try_init makes repeated calls harmless
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn parse_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("chatty"), tracing::Level::INFO);
}

#[test]
fn only_transient_receive_errors_are_recoverable() {
    assert!(!ReceiveError::Transient("blip".into()).is_fatal());
    assert!(ReceiveError::Fatal("connection dropped".into()).is_fatal());
    assert!(ReceiveError::Closed.is_fatal());
}

#[test]
fn startup_error_wraps_subscription_error() {
    let err: StartupError = SubscriptionError::Unauthorized("bad token".into()).into();
    assert_eq!(
        err.to_string(),
        "could not subscribe: authentication rejected: bad token"
    );
}
