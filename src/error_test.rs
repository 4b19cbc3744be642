use super::*;

#[test]
fn link_error_codes_are_stable() {
    assert_eq!(LinkError::ChannelClosed.error_code(), "E_CHANNEL_CLOSED");
    assert_eq!(LinkError::DuplicateChannelName("x".into()).error_code(), "E_DUPLICATE_CHANNEL");
    assert_eq!(LinkError::connection_lost("getState").error_code(), "E_CONNECTION_LOST");
    assert_eq!(LinkError::Decode("bad".into()).error_code(), "E_DECODE");
}

#[test]
fn only_connection_lost_is_retryable() {
    assert!(LinkError::connection_lost("getState").retryable());
    assert!(!LinkError::ChannelClosed.retryable());
    assert!(!LinkError::DuplicateChannelName("controller".into()).retryable());
}

#[test]
fn remote_error_keeps_fault_fields() {
    let err = LinkError::from_fault(frames::RemoteFault {
        message: "User rejected".into(),
        code: Some(4001),
        data: Some(serde_json::json!({"origin": "x"})),
    });
    assert_eq!(err.to_string(), "remote error: User rejected");
    assert_eq!(
        err,
        LinkError::RemoteError {
            message: "User rejected".into(),
            code: Some(4001),
            data: Some(serde_json::json!({"origin": "x"})),
        }
    );
}

#[test]
fn bootstrap_error_delegates_link_codes() {
    let err = BootstrapError::from(LinkError::connection_lost("getState"));
    assert_eq!(err.error_code(), "E_CONNECTION_LOST");
    assert!(err.retryable());
    assert!(!BootstrapError::Launch("boom".into()).retryable());
}

#[test]
fn connection_lost_message_names_method() {
    assert_eq!(
        LinkError::connection_lost("setLocked").to_string(),
        "connection lost while awaiting `setLocked`"
    );
}
