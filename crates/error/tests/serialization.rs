use cirrus_error::{CirrusError, ErrorCode, ErrorContext};
use serde_json::Value;

#[test]
fn test_json_serialization() {
    let error = CirrusError::new(ErrorCode::StatementFailed, "statement 2 failed: UNIQUE constraint failed")
        .with_context(ErrorContext::Statement {
            index: 2,
            total: 3,
            sql: "INSERT INTO users VALUES (1, 'Al')".to_string(),
        })
        .with_hint("ROLLBACK to discard the buffered statements");

    let json = error.to_json();
    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "CIRRUS-2006");
    assert_eq!(v["context"]["type"], "statement");
    assert_eq!(v["context"]["index"], 2);
    assert_eq!(v["context"]["total"], 3);
    assert_eq!(v["hint"], "ROLLBACK to discard the buffered statements");
}

#[test]
fn test_request_context_round_trip() {
    let error = CirrusError::new(ErrorCode::HttpStatus, "HTTP 403: Authentication error")
        .with_context(ErrorContext::Request {
            method: "POST".to_string(),
            url: "https://api.example.com/query".to_string(),
            status: Some(403),
        });

    let decoded: CirrusError = serde_json::from_str(&error.to_json()).expect("decodes");
    assert_eq!(decoded.code, ErrorCode::HttpStatus);
    assert_eq!(decoded.context, error.context);
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "CIRRUS-3006".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::AlreadyAttached);
}
