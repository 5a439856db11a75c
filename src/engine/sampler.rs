//! Token sampling from last-position logits

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RequestParams;

/// Per-sequence sampler
///
/// Sequences of one request get distinct streams from the same seed, so a
/// seeded request with `n > 1` is reproducible without every choice being
/// identical.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: &RequestParams, stream: u64) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(
                seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            ),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Pick the next token given the logits and the tokens generated so far.
    pub fn sample(&mut self, logits: &[f32], generated: &[u32], params: &RequestParams) -> u32 {
        if logits.is_empty() {
            return 0;
        }

        let mut logits = logits.to_vec();
        apply_penalties(&mut logits, generated, params);

        if params.is_greedy() {
            return argmax(&logits);
        }

        // Temperature + softmax
        let inv_temp = 1.0 / params.temperature;
        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i, ((l - max) * inv_temp).exp()))
            .collect();
        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        if !(sum.is_finite() && sum > 0.0) {
            return argmax(&logits);
        }
        for (_, p) in probs.iter_mut() {
            *p /= sum;
        }

        let filtered = params.top_k.is_some() || params.top_p < 1.0;
        if filtered {
            probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        }

        // Top-k
        if let Some(k) = params.top_k {
            probs.truncate(k.max(1));
        }

        // Top-p (nucleus)
        if params.top_p < 1.0 {
            let mut cumsum = 0.0;
            let mut keep = probs.len();
            for (i, (_, p)) in probs.iter().enumerate() {
                cumsum += p;
                if cumsum > params.top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        self.multinomial(&probs)
    }

    /// Multinomial sampling from (token, probability) pairs; renormalizes.
    fn multinomial(&mut self, probs: &[(usize, f32)]) -> u32 {
        let total: f32 = probs.iter().map(|(_, p)| p).sum();
        let sample: f32 = self.rng.gen::<f32>() * total;

        let mut cumsum = 0.0;
        for (i, p) in probs {
            cumsum += p;
            if cumsum > sample {
                return *i as u32;
            }
        }

        probs.last().map(|(i, _)| *i as u32).unwrap_or(0)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}

fn apply_penalties(logits: &mut [f32], generated: &[u32], params: &RequestParams) {
    if generated.is_empty()
        || (params.repeat_penalty == 1.0
            && params.frequency_penalty == 0.0
            && params.presence_penalty == 0.0)
    {
        return;
    }

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &token in generated {
        *counts.entry(token).or_insert(0) += 1;
    }

    for (token, count) in counts {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        if params.repeat_penalty != 1.0 {
            if *logit > 0.0 {
                *logit /= params.repeat_penalty;
            } else {
                *logit *= params.repeat_penalty;
            }
        }
        *logit -= params.frequency_penalty * count as f32 + params.presence_penalty;
    }
}
