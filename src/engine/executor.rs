//! Decode rounds for one scheduler lane
//!
//! An [`Executor`] binds one model to one device. Its lane hands it the live
//! requests once per round; the executor runs a single forward pass over every
//! live sequence, samples one token per sequence and applies the stop
//! conditions. Requests leave the round either finished, failed or still
//! decoding.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::chat::{FinishReason, Usage};
use crate::config::RequestParams;
use crate::device::DeviceRef;
use crate::error::{CacheError, InferenceError, SchedulerError};
use crate::model::{BatchItem, ModelHandle};
use crate::tokenizer::TokenizerTrait;

use super::cache::{CacheLease, CacheState};
use super::sampler::Sampler;

/// A tokenized prompt ready for scheduling
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Vec<u32>,
    pub params: RequestParams,
}

/// One finished choice
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedChoice {
    pub index: usize,
    pub tokens: Vec<u32>,
    pub text: String,
    pub finish_reason: FinishReason,
}

/// Result of a scheduled request
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub choices: Vec<GeneratedChoice>,
    pub usage: Usage,
}

pub(crate) type Reply = oneshot::Sender<Result<Generation, SchedulerError>>;

/// A request queued on a lane, not yet admitted to a round
pub(crate) struct Submission {
    pub request: GenerationRequest,
    pub lease: CacheLease,
    pub cancel: CancellationToken,
    pub reply: Reply,
}

impl Submission {
    /// The caller gave up (timeout) before the request was admitted.
    pub fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled() || self.reply.is_closed()
    }

    pub fn sequences(&self) -> usize {
        self.request.params.n.max(1)
    }

    pub fn reject(self, err: SchedulerError) {
        let _ = self.reply.send(Err(err));
    }
}

struct Sequence {
    sampler: Sampler,
    generated: Vec<u32>,
    text: String,
    finish: Option<FinishReason>,
}

/// A request taking part in decode rounds
pub(crate) struct ActiveRequest {
    id: u64,
    prompt: Vec<u32>,
    params: RequestParams,
    lease: CacheLease,
    // Ephemeral caches for choices 1..n, forked after prefill
    forks: Vec<CacheState>,
    sequences: Vec<Sequence>,
    prefilled: bool,
    // Cache length after prefix matching; restored when the request detaches
    admitted_len: usize,
    rounds: usize,
    failure: Option<SchedulerError>,
    cancel: CancellationToken,
    reply: Reply,
}

impl ActiveRequest {
    pub fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled() || self.reply.is_closed()
    }

    pub fn is_done(&self) -> bool {
        self.failure.is_some()
            || (self.prefilled && self.sequences.iter().all(|s| s.finish.is_some()))
    }

    /// Sequences still feeding tokens into the model
    pub fn live_sequences(&self) -> usize {
        if self.prefilled {
            self.sequences.iter().filter(|s| s.finish.is_none()).count()
        } else {
            self.sequences.len()
        }
    }

    /// Roll back to the admission length and drop without replying.
    pub fn detach(mut self) {
        tracing::debug!(
            "Request #{} on {} detached after {} round(s)",
            self.id,
            self.lease.key(),
            self.rounds
        );
        self.lease.truncate(self.admitted_len);
    }

    /// Fail the request, restoring its cache.
    pub fn fail(mut self, err: SchedulerError) {
        self.failure = Some(err);
        self.finish();
    }

    /// Deliver the outcome. The lease is released before the reply is sent,
    /// so the caller always observes the committed cache.
    pub fn finish(mut self) {
        let result = match self.failure.take() {
            Some(err) => {
                self.lease.truncate(self.admitted_len);
                Err(err)
            }
            None => Ok(self.generation()),
        };

        let ActiveRequest {
            lease,
            forks,
            reply,
            ..
        } = self;
        drop(forks);
        drop(lease);
        let _ = reply.send(result);
    }

    fn generation(&self) -> Generation {
        let choices: Vec<GeneratedChoice> = self
            .sequences
            .iter()
            .enumerate()
            .map(|(index, seq)| GeneratedChoice {
                index,
                tokens: seq.generated.clone(),
                text: seq.text.clone(),
                finish_reason: seq.finish.unwrap_or(FinishReason::Length),
            })
            .collect();
        let completion_tokens = choices.iter().map(|c| c.tokens.len()).sum();

        Generation {
            choices,
            usage: Usage {
                prompt_tokens: self.prompt.len(),
                completion_tokens,
                total_tokens: self.prompt.len() + completion_tokens,
                cached_tokens: self.admitted_len,
            },
        }
    }

    fn after_prefill(&mut self, logits: &[f32], tokenizer: &dyn TokenizerTrait) {
        self.prefilled = true;
        for _ in 1..self.sequences.len() {
            match self.lease.fork() {
                Ok(fork) => self.forks.push(fork),
                Err(e) => {
                    self.failure = Some(e.into());
                    return;
                }
            }
        }
        for s in 0..self.sequences.len() {
            self.advance(s, logits, tokenizer);
        }
    }

    fn advance(&mut self, s: usize, logits: &[f32], tokenizer: &dyn TokenizerTrait) {
        let (fed, limit) = if s == 0 {
            (self.lease.len(), self.lease.limit())
        } else {
            (self.forks[s - 1].len(), self.forks[s - 1].limit())
        };

        let seq = &mut self.sequences[s];
        let token = seq.sampler.sample(logits, &seq.generated, &self.params);

        if !self.params.ignore_eos && tokenizer.is_eos(token) {
            seq.finish = Some(FinishReason::Stop);
            return;
        }

        seq.generated.push(token);
        seq.text = tokenizer.decode(&seq.generated).unwrap_or_default();

        let stop_at = self
            .params
            .stop_sequences
            .iter()
            .filter_map(|stop| seq.text.find(stop.as_str()))
            .min();
        if let Some(pos) = stop_at {
            seq.text.truncate(pos);
            seq.finish = Some(FinishReason::Stop);
        } else if seq.generated.len() >= self.params.max_tokens || fed >= limit {
            // The sampled token is never fed, so the cache holds `fed` positions
            seq.finish = Some(FinishReason::Length);
        }
    }
}

/// One model on one device
#[derive(Debug)]
pub struct Executor {
    model: Arc<ModelHandle>,
    device: Arc<DeviceRef>,
}

impl Executor {
    pub fn new(model: Arc<ModelHandle>, device: Arc<DeviceRef>) -> Self {
        Self { model, device }
    }

    pub fn model(&self) -> &Arc<ModelHandle> {
        &self.model
    }

    pub fn device(&self) -> &Arc<DeviceRef> {
        &self.device
    }

    /// Match the prompt against the cached prefix and start a request.
    ///
    /// At least one prompt token is always recomputed so the prefill yields
    /// logits for the first generated token.
    pub(crate) fn admit(&self, id: u64, submission: Submission) -> ActiveRequest {
        let Submission {
            request,
            mut lease,
            cancel,
            reply,
        } = submission;
        let GenerationRequest { prompt, params } = request;

        let reuse = lease
            .common_prefix(&prompt)
            .min(prompt.len().saturating_sub(1));
        let dropped = lease.len() - reuse;
        lease.truncate(reuse);

        tracing::debug!(
            "Admitted request #{} on {}: {} prompt tokens, {} cached, {} diverged",
            id,
            lease.key(),
            prompt.len(),
            reuse,
            dropped
        );

        let sequences = (0..params.n.max(1))
            .map(|i| Sequence {
                sampler: Sampler::new(&params, i as u64),
                generated: Vec::new(),
                text: String::new(),
                finish: None,
            })
            .collect();

        let failure = prompt.is_empty().then(|| {
            SchedulerError::Inference(InferenceError::InvalidBatch("empty prompt".to_string()))
        });

        ActiveRequest {
            id,
            prompt,
            params,
            lease,
            forks: Vec::new(),
            sequences,
            prefilled: false,
            admitted_len: reuse,
            rounds: 0,
            failure,
            cancel,
            reply,
        }
    }

    /// Run one decode round over `batch`.
    ///
    /// Requests still prefilling feed their uncached prompt suffix; decoding
    /// sequences feed the token sampled last round. Blocks on the device
    /// queue; an `Err` fails every request in the batch.
    pub(crate) fn step(&self, batch: &mut [ActiveRequest]) -> Result<(), InferenceError> {
        self.device.execute(|| self.step_inner(batch))
    }

    fn step_inner(&self, batch: &mut [ActiveRequest]) -> Result<(), InferenceError> {
        // (request index, sequence index; None for prefill)
        let mut slots: Vec<(usize, Option<usize>)> = Vec::new();

        let results = {
            let mut items: Vec<BatchItem<'_>> = Vec::new();
            for (r, req) in batch.iter_mut().enumerate() {
                if req.is_done() {
                    continue;
                }
                req.rounds += 1;

                let ActiveRequest {
                    prompt,
                    lease,
                    forks,
                    sequences,
                    prefilled,
                    ..
                } = req;

                if !*prefilled {
                    let start = lease.len();
                    items.push(BatchItem {
                        tokens: &prompt[start..],
                        cache: &mut **lease,
                    });
                    slots.push((r, None));
                    continue;
                }

                let caches = std::iter::once(&mut **lease).chain(forks.iter_mut());
                for (s, (seq, cache)) in sequences.iter().zip(caches).enumerate() {
                    if seq.finish.is_some() {
                        continue;
                    }
                    if let Some(last) = seq.generated.last() {
                        items.push(BatchItem {
                            tokens: std::slice::from_ref(last),
                            cache,
                        });
                        slots.push((r, Some(s)));
                    }
                }
            }

            if items.is_empty() {
                return Ok(());
            }
            self.model.model().forward(&mut items)?
        };

        let tokenizer = self.model.tokenizer();
        for ((r, seq), result) in slots.into_iter().zip(results) {
            let req = &mut batch[r];
            if req.failure.is_some() {
                continue;
            }
            match (seq, result) {
                (None, Ok(logits)) => req.after_prefill(&logits, tokenizer),
                (Some(s), Ok(logits)) => req.advance(s, &logits, tokenizer),
                (Some(s), Err(CacheError::Overflow { .. })) => {
                    req.sequences[s].finish = Some(FinishReason::Length);
                }
                (_, Err(e)) => {
                    tracing::warn!("Request #{} failed on {}: {}", req.id, self.device.id(), e);
                    req.failure = Some(e.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DevicePool, StaticProbe};
    use crate::engine::{ConversationKey, GenerationCache};
    use crate::testing::{tiny_tokenizer, CountingModel};

    struct Fixture {
        pool: DevicePool,
        handle: Arc<ModelHandle>,
        model: Arc<CountingModel>,
        cache: GenerationCache,
    }

    fn fixture(model: CountingModel) -> Fixture {
        let probe = StaticProbe::uniform(DeviceKind::Npu, 1, 1 << 24);
        let pool = DevicePool::from_spec("npu:0", &probe).unwrap();
        let model = Arc::new(model);
        let handle = ModelHandle::place(
            "m",
            "/m",
            Arc::clone(&model) as Arc<dyn crate::model::ForwardModel>,
            tiny_tokenizer(),
            &pool,
            &Default::default(),
        )
        .unwrap();
        Fixture {
            pool,
            handle: Arc::new(handle),
            model,
            cache: GenerationCache::new(u64::MAX),
        }
    }

    impl Fixture {
        fn executor(&self) -> Executor {
            Executor::new(Arc::clone(&self.handle), Arc::clone(&self.pool.devices()[0]))
        }

        async fn submission(
            &self,
            key: &str,
            prompt: Vec<u32>,
            params: RequestParams,
        ) -> (Submission, oneshot::Receiver<Result<Generation, SchedulerError>>) {
            let lease = self
                .cache
                .get_or_create(ConversationKey::new("m", key), &self.handle, &self.pool)
                .lease()
                .await;
            let (reply, rx) = oneshot::channel();
            let submission = Submission {
                request: GenerationRequest { prompt, params },
                lease,
                cancel: CancellationToken::new(),
                reply,
            };
            (submission, rx)
        }
    }

    fn run_to_completion(executor: &Executor, mut batch: Vec<ActiveRequest>) {
        while !batch.is_empty() {
            executor.step(&mut batch).unwrap();
            let (done, live): (Vec<_>, Vec<_>) = batch.into_iter().partition(|r| r.is_done());
            done.into_iter().for_each(ActiveRequest::finish);
            batch = live;
        }
    }

    #[tokio::test]
    async fn test_max_tokens_finishes_with_length() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let params = RequestParams {
            max_tokens: 3,
            ..RequestParams::greedy()
        };
        let (sub, rx) = fx.submission("a", vec![256, 1, 2], params).await;
        run_to_completion(&exec, vec![exec.admit(0, sub)]);

        let generation = rx.await.unwrap().unwrap();
        assert_eq!(generation.choices.len(), 1);
        assert_eq!(generation.choices[0].tokens.len(), 3);
        assert_eq!(generation.choices[0].finish_reason, FinishReason::Length);
        assert_eq!(generation.usage.completion_tokens, 3);
        // prompt + all generated tokens but the last
        assert_eq!(fx.model.tokens_fed(), 3 + 2);
    }

    #[tokio::test]
    async fn test_eos_finishes_with_stop() {
        let fx = fixture(CountingModel::new().with_eos_after(2));
        let exec = fx.executor();
        let (sub, rx) = fx.submission("a", vec![256, 1], RequestParams::greedy()).await;
        run_to_completion(&exec, vec![exec.admit(0, sub)]);

        let generation = rx.await.unwrap().unwrap();
        assert_eq!(generation.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(generation.choices[0].tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_sequence_truncates_text() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let params = RequestParams {
            stop_sequences: vec!["aa".to_string()],
            ..RequestParams::greedy()
        };
        let (sub, rx) = fx.submission("a", vec![256, 1], params).await;
        run_to_completion(&exec, vec![exec.admit(0, sub)]);

        let generation = rx.await.unwrap().unwrap();
        assert_eq!(generation.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(generation.choices[0].text, "");
    }

    #[tokio::test]
    async fn test_context_limit_finishes_with_length() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let limit = fx.handle.max_context_len();
        let prompt: Vec<u32> = (0..limit as u32 - 1).map(|i| i % 200).collect();
        let (sub, rx) = fx.submission("a", prompt, RequestParams::greedy()).await;
        run_to_completion(&exec, vec![exec.admit(0, sub)]);

        let generation = rx.await.unwrap().unwrap();
        assert_eq!(generation.choices[0].finish_reason, FinishReason::Length);
        assert_eq!(generation.choices[0].tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_prefix_reuse_feeds_only_new_tokens() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let params = RequestParams {
            max_tokens: 1,
            ..RequestParams::greedy()
        };

        let (sub, rx) = fx.submission("a", vec![256, 1, 2, 3], params.clone()).await;
        run_to_completion(&exec, vec![exec.admit(0, sub)]);
        rx.await.unwrap().unwrap();
        assert_eq!(fx.model.tokens_fed(), 4);

        let (sub, rx) = fx.submission("a", vec![256, 1, 2, 3, 4, 5], params).await;
        run_to_completion(&exec, vec![exec.admit(1, sub)]);
        let generation = rx.await.unwrap().unwrap();
        assert_eq!(generation.usage.cached_tokens, 4);
        assert_eq!(fx.model.tokens_fed(), 6);
        assert_eq!(fx.model.full_prefills(), 1);
    }

    #[tokio::test]
    async fn test_multiple_choices_commit_only_the_first() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let params = RequestParams {
            n: 3,
            max_tokens: 4,
            ..RequestParams::greedy()
        };
        let (sub, rx) = fx.submission("a", vec![256, 7], params).await;
        run_to_completion(&exec, vec![exec.admit(0, sub)]);

        let generation = rx.await.unwrap().unwrap();
        assert_eq!(generation.choices.len(), 3);
        assert_eq!(generation.usage.completion_tokens, 12);

        let lease = fx
            .cache
            .get_or_create(ConversationKey::new("m", "a"), &fx.handle, &fx.pool)
            .lease()
            .await;
        assert_eq!(lease.len(), 2 + 3);
    }

    #[tokio::test]
    async fn test_detach_restores_admission_length() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let (sub, rx) = fx.submission("a", vec![256, 1, 2], RequestParams::greedy()).await;
        let mut batch = vec![exec.admit(0, sub)];
        exec.step(&mut batch).unwrap();
        exec.step(&mut batch).unwrap();
        drop(rx);

        let req = batch.pop().unwrap();
        assert!(req.is_abandoned());
        req.detach();

        let lease = fx
            .cache
            .get_or_create(ConversationKey::new("m", "a"), &fx.handle, &fx.pool)
            .lease()
            .await;
        assert_eq!(lease.len(), 0);
    }

    #[tokio::test]
    async fn test_device_error_fails_batch() {
        let fx = fixture(CountingModel::new());
        let exec = fx.executor();
        let (sub, _rx) = fx.submission("a", vec![256, 1], RequestParams::greedy()).await;
        let mut batch = vec![exec.admit(0, sub)];
        fx.model.fail_next(InferenceError::Device("ecc error".to_string()));
        assert!(matches!(exec.step(&mut batch), Err(InferenceError::Device(_))));
    }
}
