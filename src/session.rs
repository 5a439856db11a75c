//! Session runtime
//!
//! A [`Session`] is the object behind an inference handle. It binds a device
//! pool, the loaded models, a generation cache and the batch scheduler, and
//! owns the worker runtime they run on.
//!
//! ```text
//! Created ──initialize──▶ Initialized ──destroy──▶ Destroyed
//!    ▲  │                      │                       ▲
//!    └──┘ (failure)        device lost                 │
//!                              ▼                       │
//!                           Failed ──────destroy───────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatMessage, Choice, Response, Status};
use crate::config::{InitOptions, RequestParams};
use crate::device::{DeviceId, DevicePool, DeviceProbe, DeviceSelection, SystemProbe};
use crate::engine::{
    BatchScheduler, CacheStats, ConversationKey, GenerationCache, GenerationRequest,
};
use crate::error::{InitError, SchedulerError};
use crate::loader::{ModelLoader, SafeTensorsLoader};
use crate::model::{ArchitectureDescriptor, ModelHandle};
use crate::tokenizer::render_chat;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Initialized,
    /// A device was lost; only `destroy` is meaningful
    Failed,
    Destroyed,
}

/// A model served by the session
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub path: PathBuf,
    pub descriptor: ArchitectureDescriptor,
    pub devices: Vec<DeviceId>,
    pub max_batch_size: usize,
    pub max_context_len: usize,
}

/// Memory use of a bound device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub capacity: u64,
    pub used: u64,
}

// Everything an initialized session owns. Field order is drop order.
struct Bound {
    scheduler: BatchScheduler,
    cache: GenerationCache,
    // Registration order; the first model is the primary one
    models: Vec<Arc<ModelHandle>>,
    devices: DevicePool,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Bound {
    fn model(&self, model_id: &str) -> Option<&Arc<ModelHandle>> {
        if model_id.is_empty() {
            return self.models.first();
        }
        self.models.iter().find(|m| m.id() == model_id)
    }

    fn shutdown(&self) {
        self.scheduler.shutdown();
        let evicted = self.cache.evict_all();
        tracing::debug!("Released {} cache entries", evicted);
    }
}

impl Drop for Bound {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

enum State {
    Created,
    Initialized(Arc<Bound>),
    Destroyed,
}

// What a completion call continues
enum Prompt<'a> {
    Chat(&'a [ChatMessage]),
    Text(&'a str),
    Tokens(&'a [u32]),
}

impl Prompt<'_> {
    /// Shape checks that need no model
    fn check(&self) -> Result<(), String> {
        match self {
            Prompt::Chat(messages) => {
                if messages.is_empty() {
                    return Err("no messages".to_string());
                }
                match messages
                    .iter()
                    .position(|m| m.role.is_empty() || m.content.is_empty())
                {
                    Some(i) => Err(format!("message {} has an empty role or content", i)),
                    None => Ok(()),
                }
            }
            Prompt::Text(text) if text.is_empty() => Err("empty prompt".to_string()),
            Prompt::Tokens(tokens) if tokens.is_empty() => Err("empty prompt".to_string()),
            _ => Ok(()),
        }
    }

    /// Prompt tokens and the cache key they belong to
    fn tokenize(
        &self,
        model: &ModelHandle,
        params: &RequestParams,
    ) -> Result<(Vec<u32>, ConversationKey), String> {
        match self {
            Prompt::Chat(messages) => {
                let tokens = model
                    .tokenizer()
                    .encode(&render_chat(messages))
                    .map_err(|e| e.to_string())?;
                Ok((tokens, ConversationKey::for_request(model.id(), messages, params)))
            }
            Prompt::Text(text) => {
                let tokens = model.tokenizer().encode(text).map_err(|e| e.to_string())?;
                let key = ConversationKey::for_prompt(model.id(), &tokens, params);
                Ok((tokens, key))
            }
            Prompt::Tokens(tokens) => {
                let vocab = model.descriptor().vocab_size;
                if let Some(bad) = tokens.iter().find(|&&t| t as usize >= vocab) {
                    return Err(format!("token {} is outside the vocabulary of {}", bad, vocab));
                }
                let key = ConversationKey::for_prompt(model.id(), tokens, params);
                Ok((tokens.to_vec(), key))
            }
        }
    }
}

/// Inference session
///
/// `Session` is `Send + Sync`; any number of threads may call
/// [`chat_completion`](Session::chat_completion) concurrently. Blocking calls
/// must not be made from inside an async runtime.
pub struct Session {
    probe: Arc<dyn DeviceProbe>,
    loader: Arc<dyn ModelLoader>,
    state: RwLock<State>,
}

impl Session {
    /// A session over the host's devices and SafeTensors models
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SystemProbe))
    }

    pub fn with_probe(probe: Arc<dyn DeviceProbe>) -> Self {
        Self::with_loader(probe, Arc::new(SafeTensorsLoader))
    }

    pub fn with_loader(probe: Arc<dyn DeviceProbe>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            probe,
            loader,
            state: RwLock::new(State::Created),
        }
    }

    pub fn state(&self) -> SessionState {
        match &*self.read_state() {
            State::Created => SessionState::Created,
            State::Initialized(bound) if bound.scheduler.is_failed() => SessionState::Failed,
            State::Initialized(_) => SessionState::Initialized,
            State::Destroyed => SessionState::Destroyed,
        }
    }

    /// Resolve devices, load every model under `model_path` and start the
    /// scheduler.
    ///
    /// On failure the session stays `Created` and may be initialized again.
    pub fn initialize(
        &self,
        model_path: impl AsRef<Path>,
        devices: &str,
        options: &InitOptions,
    ) -> Result<(), InitError> {
        let model_path = model_path.as_ref();
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        match &*state {
            State::Created => {}
            State::Initialized(_) => return Err(InitError::AlreadyInitialized),
            State::Destroyed => return Err(InitError::Destroyed),
        }

        let selection = DeviceSelection::parse(devices)?;
        let pool = DevicePool::resolve(&selection, self.probe.as_ref())?;
        tracing::info!(
            "Resolved '{}' to {}",
            devices,
            pool.ids()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let models: Vec<Arc<ModelHandle>> = self
            .loader
            .load(model_path, &pool, options)?
            .into_iter()
            .map(Arc::new)
            .collect();
        if models.is_empty() {
            return Err(crate::error::ModelLoadError::MissingWeights(format!(
                "no models under {}",
                model_path.display()
            ))
            .into());
        }

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.thread_name("genrec-worker").enable_all();
        if let Some(threads) = options.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        let runtime = builder.build()?;

        let scheduler = BatchScheduler::start(runtime.handle(), &models, &pool, options);
        let cache = GenerationCache::new(options.cache_budget_bytes());

        tracing::info!(
            "Session initialized: {} model(s) [{}] on {} device(s)",
            models.len(),
            models.iter().map(|m| m.id()).collect::<Vec<_>>().join(", "),
            pool.len()
        );

        *state = State::Initialized(Arc::new(Bound {
            scheduler,
            cache,
            models,
            devices: pool,
            runtime: Some(runtime),
        }));
        Ok(())
    }

    /// Run one chat completion.
    ///
    /// `model_id` may be empty to select the primary model. `timeout` of
    /// `None` waits indefinitely. The result is always a [`Response`];
    /// failures are reported through its status.
    pub fn chat_completion(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        timeout: Option<Duration>,
        params: &RequestParams,
    ) -> Response {
        self.complete(model_id, Prompt::Chat(messages), timeout, params)
    }

    /// Continue raw text, without the chat template.
    pub fn text_completion(
        &self,
        model_id: &str,
        text: &str,
        timeout: Option<Duration>,
        params: &RequestParams,
    ) -> Response {
        self.complete(model_id, Prompt::Text(text), timeout, params)
    }

    /// Continue a pre-tokenized prompt, such as a history of item ids.
    pub fn token_completion(
        &self,
        model_id: &str,
        tokens: &[u32],
        timeout: Option<Duration>,
        params: &RequestParams,
    ) -> Response {
        self.complete(model_id, Prompt::Tokens(tokens), timeout, params)
    }

    fn complete(
        &self,
        model_id: &str,
        prompt: Prompt<'_>,
        timeout: Option<Duration>,
        params: &RequestParams,
    ) -> Response {
        let bound = match &*self.read_state() {
            State::Initialized(bound) => Arc::clone(bound),
            _ => {
                return Response::failure(
                    model_id,
                    Status::NotInitialized,
                    "session is not initialized",
                )
            }
        };
        if bound.scheduler.is_failed() {
            return Response::failure(
                model_id,
                Status::NotInitialized,
                "session failed after a device was lost",
            );
        }

        if let Err(reason) = prompt.check() {
            return Response::failure(model_id, Status::InvalidRequest, reason);
        }
        if let Err(reason) = params.validate() {
            return Response::failure(model_id, Status::InvalidRequest, reason);
        }

        let Some(model) = bound.model(model_id) else {
            return Response::failure(
                model_id,
                Status::InvalidRequest,
                format!("unknown model '{}'", model_id),
            );
        };
        let model = Arc::clone(model);

        let (tokens, key) = match prompt.tokenize(&model, params) {
            Ok(encoded) => encoded,
            Err(reason) => return Response::failure(model.id(), Status::InvalidRequest, reason),
        };
        if tokens.len() > model.max_context_len() {
            return Response::failure(
                model.id(),
                Status::InvalidRequest,
                format!(
                    "prompt of {} tokens exceeds the context window of {}",
                    tokens.len(),
                    model.max_context_len()
                ),
            );
        }

        let request = GenerationRequest {
            prompt: tokens,
            params: params.clone(),
        };
        let cancel = CancellationToken::new();
        // Detaches the request from its lane on every exit path
        let _detach = cancel.clone().drop_guard();

        let Some(runtime) = bound.runtime.as_ref() else {
            return Response::failure(model.id(), Status::NotInitialized, "session runtime stopped");
        };
        let outcome = runtime.block_on(async {
            let work = async {
                let slot = bound.cache.get_or_create(key, &model, &bound.devices);
                let lease = slot.lease().await;
                bound.scheduler.submit(lease, request, cancel.clone()).await
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.ok(),
                None => Some(work.await),
            }
        });

        match outcome {
            Some(Ok(generation)) => {
                let choices = generation
                    .choices
                    .into_iter()
                    .map(|c| Choice {
                        index: c.index,
                        message: ChatMessage::assistant(c.text),
                        token_ids: c.tokens,
                        finish_reason: c.finish_reason,
                    })
                    .collect();
                Response::success(model.id(), choices, generation.usage)
            }
            Some(Err(SchedulerError::LaneClosed)) if bound.scheduler.is_shut_down() => {
                Response::failure(model.id(), Status::NotInitialized, "session was destroyed")
            }
            Some(Err(e)) => {
                tracing::warn!("Request on '{}' failed: {}", model.id(), e);
                Response::failure(model.id(), Status::InternalError, e.to_string())
            }
            None => {
                tracing::debug!("Request on '{}' timed out", model.id());
                Response::failure(model.id(), Status::Timeout, "deadline exceeded")
            }
        }
    }

    /// Release cache entries, models and devices. Idempotent.
    pub fn destroy(&self) {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *state, State::Destroyed)
        };
        if let State::Initialized(bound) = previous {
            bound.shutdown();
            tracing::info!("Session destroyed");
        }
    }

    /// Models served by this session, primary first
    pub fn models(&self) -> Vec<ModelInfo> {
        let State::Initialized(bound) = &*self.read_state() else {
            return Vec::new();
        };
        bound
            .models
            .iter()
            .map(|m| ModelInfo {
                id: m.id().to_string(),
                path: m.path().to_path_buf(),
                descriptor: m.descriptor().clone(),
                devices: bound.scheduler.lane_devices(m.id()),
                max_batch_size: m.max_batch_size(),
                max_context_len: m.max_context_len(),
            })
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        let State::Initialized(bound) = &*self.read_state() else {
            return Vec::new();
        };
        bound
            .devices
            .devices()
            .iter()
            .map(|d| DeviceStatus {
                id: d.id(),
                capacity: d.arena().capacity(),
                used: d.arena().used(),
            })
            .collect()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        match &*self.read_state() {
            State::Initialized(bound) => Some(bound.cache.stats()),
            _ => None,
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("state", &self.state()).finish()
    }
}
