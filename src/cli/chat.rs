//! Chat command

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::find_model_path;
use crate::chat::{ChatMessage, Response};
use crate::config::{RequestParams, RuntimeConfig};
use crate::session::Session;

/// Answer one prompt, or chat interactively when `prompt` is `None`
#[allow(clippy::too_many_arguments)]
pub fn chat(
    model: String,
    prompt: Option<String>,
    devices: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    timeout_ms: u32,
    config: Option<std::path::PathBuf>,
    json: bool,
) -> Result<()> {
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)?,
        None => RuntimeConfig::default(),
    };
    let devices = devices
        .or_else(|| config.devices.clone())
        .unwrap_or_else(|| "auto".to_string());

    let mut params = config.request.clone();
    if let Some(max_tokens) = max_tokens {
        params.max_tokens = max_tokens;
    }
    if let Some(temperature) = temperature {
        params.temperature = temperature;
    }
    if let Some(top_p) = top_p {
        params.top_p = top_p;
    }
    params.validate().map_err(|e| anyhow!(e))?;

    let model_path = find_model_path(&model)?;
    tracing::info!("Loading model: {}", model_path.display());

    let session = Session::new();
    session.initialize(&model_path, &devices, &config.init)?;
    let timeout = (timeout_ms > 0).then(|| Duration::from_millis(u64::from(timeout_ms)));

    match prompt {
        Some(prompt) => {
            let response =
                session.chat_completion("", &[ChatMessage::user(prompt)], timeout, &params);
            print_response(&response, json)?;
        }
        None => interactive(&session, timeout, params, json)?,
    }

    session.destroy();
    Ok(())
}

fn interactive(
    session: &Session,
    timeout: Option<Duration>,
    mut params: RequestParams,
    json: bool,
) -> Result<()> {
    // One conversation per run, so even an edited history lands on the same cache entry
    params
        .conversation_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());

    println!("Type a message, or /quit to exit.");
    let mut history: Vec<ChatMessage> = Vec::new();
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }

        history.push(ChatMessage::user(line));
        let response = session.chat_completion("", &history, timeout, &params);
        print_response(&response, json)?;
        match response.text() {
            Some(text) => history.push(ChatMessage::assistant(text)),
            // Keep the history consistent with the cached conversation
            None => {
                history.pop();
            }
        }
    }
    Ok(())
}

fn print_response(response: &Response, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    if !response.status.is_success() {
        eprintln!(
            "[{:?}] {}",
            response.status,
            response.error.as_deref().unwrap_or("request failed")
        );
        return Ok(());
    }
    for choice in &response.choices {
        if response.choices.len() > 1 {
            println!("--- choice {} ({})", choice.index, choice.finish_reason.as_str());
        }
        println!("{}", choice.message.content);
    }
    tracing::debug!(
        "{} prompt + {} completion tokens ({} cached)",
        response.usage.prompt_tokens,
        response.usage.completion_tokens,
        response.usage.cached_tokens
    );
    Ok(())
}
