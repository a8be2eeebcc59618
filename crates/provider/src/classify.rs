//! Maps raw remote failures onto [`ErrorKind`].
//!
//! This is the only place that looks at status codes and error strings.

use warden_core::ErrorKind;

/// Classifies a failed call from its HTTP status (`None` for transport
/// failures), the Google RPC status string if the body had one, and the message.
pub fn classify(http_status: Option<u16>, rpc_status: Option<&str>, message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();

    if let Some(kind) = rpc_status.and_then(|s| from_rpc_status(s, &lower)) {
        return kind;
    }

    match http_status {
        None => ErrorKind::Unavailable,
        Some(400) if is_token_problem(&lower) => ErrorKind::Reauthenticate,
        Some(400) => ErrorKind::InvalidArgument,
        Some(401) => ErrorKind::Reauthenticate,
        Some(403) => ErrorKind::PermissionDenied,
        Some(404) => ErrorKind::NotFound,
        Some(409) if is_concurrency_problem(&lower) => ErrorKind::StaleToken,
        Some(409) => ErrorKind::AlreadyExists,
        Some(412) => ErrorKind::StaleToken,
        Some(429) => ErrorKind::RateLimited,
        Some(500..=599) => ErrorKind::Unavailable,
        Some(_) => ErrorKind::Other,
    }
}

fn from_rpc_status(status: &str, lower_message: &str) -> Option<ErrorKind> {
    let kind = match status {
        "NOT_FOUND" => ErrorKind::NotFound,
        "PERMISSION_DENIED" => ErrorKind::PermissionDenied,
        "ALREADY_EXISTS" => ErrorKind::AlreadyExists,
        "INVALID_ARGUMENT" => ErrorKind::InvalidArgument,
        "RESOURCE_EXHAUSTED" => ErrorKind::RateLimited,
        "ABORTED" => ErrorKind::StaleToken,
        "FAILED_PRECONDITION" if is_concurrency_problem(lower_message) => ErrorKind::StaleToken,
        "FAILED_PRECONDITION" if is_constraint_problem(lower_message) => ErrorKind::ConstraintViolation,
        "UNAUTHENTICATED" => ErrorKind::Reauthenticate,
        "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" => ErrorKind::Unavailable,
        _ => return None,
    };
    Some(kind)
}

fn is_concurrency_problem(lower: &str) -> bool {
    lower.contains("etag") || lower.contains("concurrent")
}

fn is_constraint_problem(lower: &str) -> bool {
    lower.contains("constraint") && lower.contains("violat")
}

fn is_token_problem(lower: &str) -> bool {
    lower.contains("invalid_token") || lower.contains("invalid_grant")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_status_wins_over_http_status() {
        assert_eq!(classify(Some(400), Some("FAILED_PRECONDITION"), "etag mismatch"), ErrorKind::StaleToken);
        assert_eq!(classify(Some(403), Some("RESOURCE_EXHAUSTED"), "quota"), ErrorKind::RateLimited);
        assert_eq!(classify(Some(409), Some("ALREADY_EXISTS"), "Requested entity already exists"), ErrorKind::AlreadyExists);
    }

    #[test]
    fn http_fallbacks() {
        assert_eq!(classify(Some(401), None, ""), ErrorKind::Reauthenticate);
        assert_eq!(classify(Some(400), None, "{\"error\": \"invalid_token\"}"), ErrorKind::Reauthenticate);
        assert_eq!(classify(Some(400), None, "bad field"), ErrorKind::InvalidArgument);
        assert_eq!(classify(Some(409), None, "There were concurrent policy changes"), ErrorKind::StaleToken);
        assert_eq!(classify(Some(409), None, "exists"), ErrorKind::AlreadyExists);
        assert_eq!(classify(Some(429), None, ""), ErrorKind::RateLimited);
        assert_eq!(classify(Some(503), None, ""), ErrorKind::Unavailable);
        assert_eq!(classify(None, None, "connection reset"), ErrorKind::Unavailable);
        assert_eq!(classify(Some(418), None, ""), ErrorKind::Other);
    }

    #[test]
    fn org_policy_rejection_is_a_constraint_violation() {
        let message = "Constraint constraints/gcp.restrictServiceUsage violated for projects/app \
                       attempting to enable service iap.googleapis.com.";
        assert_eq!(classify(Some(400), Some("FAILED_PRECONDITION"), message), ErrorKind::ConstraintViolation);
        assert!(!ErrorKind::ConstraintViolation.is_transient());
    }

    #[test]
    fn unknown_rpc_status_falls_back_to_http() {
        assert_eq!(classify(Some(404), Some("SOMETHING_NEW"), ""), ErrorKind::NotFound);
        assert_eq!(classify(Some(400), Some("FAILED_PRECONDITION"), "service disabled"), ErrorKind::InvalidArgument);
    }
}
