//! Unit tests for the process-error summary classifier.

use cloud_codex::errors::classify_error;

/// `401` anywhere in the details maps to the auth-failure summary.
#[test]
fn http_401_maps_to_auth_failure() {
    assert_eq!(
        classify_error("ERROR http 401 Unauthorized: invalid_api_key"),
        "鉴权失败：API Key 无效"
    );
}

/// `invalid_api_key` alone is enough, case-insensitively.
#[test]
fn invalid_api_key_maps_to_auth_failure() {
    assert_eq!(classify_error("Invalid_API_Key rejected"), "鉴权失败：API Key 无效");
}

/// `timeout` maps to the timeout summary, case-insensitively.
#[test]
fn timeout_maps_to_timeout_summary() {
    assert_eq!(classify_error("request Timeout after 60s"), "请求超时");
}

/// Auth takes precedence over timeout when both substrings appear.
#[test]
fn auth_wins_over_timeout() {
    assert_eq!(
        classify_error("timeout waiting for 401 retry"),
        "鉴权失败：API Key 无效"
    );
}

/// Anything else falls back to the generic process-error summary.
#[test]
fn unknown_details_fall_back_to_generic() {
    assert_eq!(classify_error("segfault at 0x0"), "Codex 进程错误");
    assert_eq!(classify_error(""), "Codex 进程错误");
}
