use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Form;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;

use crate::services::conversation;
use crate::state::AppState;

#[derive(Deserialize)]
#[allow(dead_code)]
pub struct TwilioWebhookForm {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "MessageSid")]
    pub message_sid: Option<String>,
}

fn validate_twilio_signature(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &[(&str, &str)],
) -> bool {
    // Data to sign: URL + params concatenated in key order
    let mut data = url.to_string();
    let mut sorted_params = params.to_vec();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in &sorted_params {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac = match Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(data.as_bytes());
    let result = mac.finalize().into_bytes();
    let expected = base64::engine::general_purpose::STANDARD.encode(result);

    expected == signature
}

pub async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    let from = form.from.trim().to_string();
    let body = form.body.trim().to_string();

    tracing::info!(from = %from, "incoming WhatsApp message");

    // Validate Twilio signature (skip if auth token is empty — dev mode)
    if !state.config.twilio_auth_token.is_empty() {
        let signature = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if signature.is_empty() {
            tracing::warn!("missing X-Twilio-Signature header");
            return (axum::http::StatusCode::FORBIDDEN, "Missing signature").into_response();
        }

        // Reconstruct webhook URL — use X-Forwarded-Proto/Host if behind proxy
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("https");
        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get("host"))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let url = format!("{proto}://{host}/webhook/whatsapp");

        let params = [
            ("From", from.as_str()),
            ("To", form.to.as_str()),
            ("Body", body.as_str()),
            ("MessageSid", form.message_sid.as_deref().unwrap_or("")),
        ];

        if !validate_twilio_signature(&state.config.twilio_auth_token, signature, &url, &params) {
            tracing::warn!("invalid Twilio signature");
            return (axum::http::StatusCode::FORBIDDEN, "Invalid signature").into_response();
        }
    }

    match conversation::process_message(&state, &from, &body, form.message_sid.as_deref()).await {
        Ok(reply) => {
            if let Err(e) = state.messaging.send_message(&from, &reply).await {
                tracing::error!(error = %e, "failed to send reply");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, from = %from, "conversation processing failed");
            let fallback = "Sorry, I'm having trouble right now. Please try again in a moment.";
            if let Err(e) = state.messaging.send_message(&from, fallback).await {
                tracing::error!(error = %e, "failed to send fallback reply");
            }
        }
    }

    twiml_response()
}

fn twiml_response() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/xml")],
        r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#,
    )
        .into_response()
}
