//! Handle-based entry points
//!
//! Every function here accepts a missing handle or argument and never panics
//! across the boundary: failures become `false`, `None` or a [`Response`]
//! with a non-success [`Status`].

use std::time::Duration;

use crate::chat::{ChatMessage, Response, Status};
use crate::config::{InitOptions, RequestParams};
use crate::session::Session;

/// Opaque inference handle
#[derive(Debug)]
pub struct Handle {
    session: Session,
}

impl Handle {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// Create a handle over the host's devices.
pub fn create() -> Option<Box<Handle>> {
    Some(Box::new(Handle::new(Session::new())))
}

/// Release everything a handle holds. Safe to call twice or with `None`.
pub fn destroy(handle: Option<&Handle>) {
    if let Some(handle) = handle {
        handle.session.destroy();
    }
}

pub fn init_options_default(options: Option<&mut InitOptions>) {
    if let Some(options) = options {
        *options = InitOptions::default();
    }
}

pub fn request_params_default(params: Option<&mut RequestParams>) {
    if let Some(params) = params {
        *params = RequestParams::default();
    }
}

/// Load models from `model_path` onto `devices`.
///
/// Returns `false` on any failure; the reason is logged.
pub fn initialize(
    handle: Option<&Handle>,
    model_path: &str,
    devices: &str,
    options: Option<&InitOptions>,
) -> bool {
    let Some(handle) = handle else {
        tracing::warn!("initialize called without a handle");
        return false;
    };
    let defaults;
    let options = match options {
        Some(options) => options,
        None => {
            defaults = InitOptions::default();
            &defaults
        }
    };

    match handle.session.initialize(model_path, devices, options) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Failed to initialize from {}: {}", model_path, e);
            false
        }
    }
}

/// Run a chat completion on the first `messages_count` entries of `messages`.
///
/// `timeout_ms = 0` waits without a deadline. The returned response must be
/// handed to [`free_response`].
pub fn chat_completions(
    handle: Option<&Handle>,
    model_id: &str,
    messages: Option<&[ChatMessage]>,
    messages_count: usize,
    timeout_ms: u32,
    params: Option<&RequestParams>,
) -> Option<Box<Response>> {
    let Some(handle) = handle else {
        return rejected(model_id, Status::NotInitialized, "no handle");
    };

    let messages = match messages {
        Some(messages) if messages_count <= messages.len() => &messages[..messages_count],
        Some(messages) => {
            return rejected(
                model_id,
                Status::InvalidRequest,
                format!(
                    "messages_count {} exceeds the {} messages given",
                    messages_count,
                    messages.len()
                ),
            )
        }
        None => return rejected(model_id, Status::InvalidRequest, "messages missing"),
    };

    let params = params.cloned().unwrap_or_default();
    Some(Box::new(handle.session.chat_completion(
        model_id,
        messages,
        deadline(timeout_ms),
        &params,
    )))
}

/// Continue `prompt` as raw text, without the chat template.
pub fn text_completions(
    handle: Option<&Handle>,
    model_id: &str,
    prompt: Option<&str>,
    timeout_ms: u32,
    params: Option<&RequestParams>,
) -> Option<Box<Response>> {
    let Some(handle) = handle else {
        return rejected(model_id, Status::NotInitialized, "no handle");
    };
    let Some(prompt) = prompt else {
        return rejected(model_id, Status::InvalidRequest, "prompt missing");
    };

    let params = params.cloned().unwrap_or_default();
    Some(Box::new(handle.session.text_completion(
        model_id,
        prompt,
        deadline(timeout_ms),
        &params,
    )))
}

/// Continue the first `tokens_count` ids of `tokens`.
pub fn token_completions(
    handle: Option<&Handle>,
    model_id: &str,
    tokens: Option<&[u32]>,
    tokens_count: usize,
    timeout_ms: u32,
    params: Option<&RequestParams>,
) -> Option<Box<Response>> {
    let Some(handle) = handle else {
        return rejected(model_id, Status::NotInitialized, "no handle");
    };
    let tokens = match tokens {
        Some(tokens) if tokens_count <= tokens.len() => &tokens[..tokens_count],
        Some(tokens) => {
            return rejected(
                model_id,
                Status::InvalidRequest,
                format!(
                    "tokens_count {} exceeds the {} tokens given",
                    tokens_count,
                    tokens.len()
                ),
            )
        }
        None => return rejected(model_id, Status::InvalidRequest, "tokens missing"),
    };

    let params = params.cloned().unwrap_or_default();
    Some(Box::new(handle.session.token_completion(
        model_id,
        tokens,
        deadline(timeout_ms),
        &params,
    )))
}

// `0` waits without a deadline
fn deadline(timeout_ms: u32) -> Option<Duration> {
    (timeout_ms > 0).then(|| Duration::from_millis(u64::from(timeout_ms)))
}

fn rejected(model_id: &str, status: Status, error: impl Into<String>) -> Option<Box<Response>> {
    Some(Box::new(Response::failure(model_id, status, error)))
}

/// Release a response. `None` is a no-op.
pub fn free_response(response: Option<Box<Response>>) {
    drop(response);
}
