//! The webhook ingress: the security-critical edge of the service.
//!
//! Every inbound delivery is authenticated with a constant-time HMAC check
//! before anything else looks at the body. A valid `/bisect` comment becomes
//! at most one `pending` row; the response goes out before any execution
//! starts. Malformed commands get a polite reply on the issue and are not
//! request failures.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use bisectd::command::{BisectCommand, CommandError};
use bisectd::job::JobSpec;
use bisectd::security::{validate_installation_id, validate_repo_name, validate_repo_owner};
use bisectd::store::JobStore;

use crate::AppState;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

#[derive(Deserialize)]
struct WebhookPayload {
    action: Option<String>,
    comment: Option<CommentPart>,
    issue: Option<IssuePart>,
    repository: Option<RepositoryPart>,
    installation: Option<InstallationPart>,
}

#[derive(Deserialize)]
struct CommentPart {
    body: Option<String>,
    user: Option<UserPart>,
}

#[derive(Deserialize)]
struct UserPart {
    login: String,
}

#[derive(Deserialize)]
struct IssuePart {
    number: i64,
}

#[derive(Deserialize)]
struct RepositoryPart {
    name: String,
    owner: OwnerPart,
}

#[derive(Deserialize)]
struct OwnerPart {
    login: String,
}

#[derive(Deserialize)]
struct InstallationPart {
    id: i64,
}

/// Constant-time verification of `sha256=<hex>` against the body.
fn signature_matches(secret: &SecretString, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(supplied) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&supplied).into()
}

/// Client address for rejection logs, proxy-aware.
fn client_addr(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn ok(body: serde_json::Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn bad_request(detail: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": detail })),
    )
        .into_response()
}

pub async fn deliver<S: JobStore + Clone + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !signature_matches(&state.webhook_secret, &body, signature) {
        // Nothing from the body may appear here; it is unauthenticated.
        warn!(event, source = %client_addr(&headers), "webhook signature mismatch");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid signature" })),
        )
            .into_response();
    }

    if event != "issue_comment" {
        return ok(serde_json::json!({ "status": "ignored" }));
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return bad_request("malformed payload"),
    };
    if payload.action.as_deref() != Some("created") {
        return ok(serde_json::json!({ "status": "ignored" }));
    }

    let (Some(comment), Some(issue), Some(repository), Some(installation)) = (
        payload.comment,
        payload.issue,
        payload.repository,
        payload.installation,
    ) else {
        return bad_request("missing fields");
    };
    let (Some(comment_body), Some(user)) = (comment.body, comment.user) else {
        return bad_request("missing fields");
    };

    let command = match BisectCommand::parse(&comment_body) {
        Ok(command) => command,
        Err(CommandError::NotACommand) => {
            return ok(serde_json::json!({ "status": "ignored" }));
        }
        Err(err) => {
            reply_rejection(&state, &repository, &installation, issue.number, &err.to_string());
            return ok(serde_json::json!({ "status": "rejected" }));
        }
    };

    let (repo_owner, repo_name, installation_id) = match (
        validate_repo_owner(&repository.owner.login),
        validate_repo_name(&repository.name),
        validate_installation_id(installation.id),
    ) {
        (Ok(owner), Ok(name), Ok(id)) => (owner, name, id),
        _ => return bad_request("invalid repository coordinates"),
    };

    let spec = JobSpec {
        repo_owner,
        repo_name,
        installation_id,
        issue_number: issue.number,
        requester: user.login,
        good_sha: command.good_sha,
        bad_sha: command.bad_sha,
        test_command: command.test_command,
    };

    match state.store.create(spec).await {
        Ok(job_id) => {
            info!(%job_id, "bisect job accepted");
            state.waker.wake();
            ok(serde_json::json!({ "status": "accepted", "job_id": job_id }))
        }
        Err(err) => {
            warn!(error = %err, "job creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "job store unavailable" })),
            )
                .into_response()
        }
    }
}

/// Posts the polite rejection reply without holding the webhook response
/// open for it.
fn reply_rejection<S: JobStore + Clone + Send + Sync + 'static>(
    state: &AppState<S>,
    repository: &RepositoryPart,
    installation: &InstallationPart,
    issue_number: i64,
    detail: &str,
) {
    let forge = state.forge.clone();
    let owner = repository.owner.login.clone();
    let repo = repository.name.clone();
    let installation_id = installation.id;
    let body = format!(
        "⚠️ Could not start a bisect: {detail}\n\n\
         Usage: `/bisect <good_sha> <bad_sha> <test_command>`"
    );
    tokio::spawn(async move {
        if let Err(err) = forge
            .create_comment(installation_id, &owner, &repo, issue_number, &body)
            .await
        {
            warn!(error = %err, "could not post rejection reply");
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signatures_verify_and_reject() {
        let secret = SecretString::from("0123456789abcdef");
        let body = br#"{"action":"created"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(b"0123456789abcdef").unwrap();
        mac.update(body);
        let valid = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(signature_matches(&secret, body, &valid));
        assert!(!signature_matches(&secret, body, "sha256=deadbeef"));
        assert!(!signature_matches(&secret, body, &valid.replace("sha256=", "sha1=")));
        assert!(!signature_matches(&secret, body, ""));
        assert!(!signature_matches(&secret, b"tampered body", &valid));
    }

    #[test]
    fn forwarded_addresses_take_the_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.9, 10.0.0.1".parse().unwrap(),
        );
        assert_eq!(client_addr(&headers), "203.0.113.9");
        assert_eq!(client_addr(&HeaderMap::new()), "unknown");
    }
}
