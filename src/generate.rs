use crate::model::MambaLm;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Lazy autoregressive token sampler.
///
/// Each step reruns the full forward pass over the whole sequence produced so
/// far and samples from the last position's logits; there is no incremental
/// mixer-state cache, so emitting `n` tokens costs `n` forward passes over
/// growing prefixes. The iterator owns the growing sequence and, when
/// sampling, a generator seeded once at construction. Dropping it cancels
/// generation.
pub struct TokenGenerator<'m, B: Backend> {
    model: &'m MambaLm<B>,
    device: B::Device,
    vocab_size: usize,
    ids: Vec<u32>,
    remaining: usize,
    temperature: f64,
    top_k: Option<usize>,
    rng: Option<StdRng>,
}

impl<'m, B: Backend> TokenGenerator<'m, B> {
    pub(crate) fn new(
        model: &'m MambaLm<B>,
        tokens: &[u32],
        max_tokens: usize,
        temperature: f64,
        top_k: Option<usize>,
        seed: u64,
    ) -> Self {
        let [vocab_size, _] = model.embedding.weight.dims();
        assert!(!tokens.is_empty(), "generation needs a non-empty prompt");
        for &token in tokens {
            assert!(
                (token as usize) < vocab_size,
                "prompt id {token} outside vocabulary of size {vocab_size}",
            );
        }

        // greedy selection needs no randomness
        let rng = (temperature > 0.0).then(|| StdRng::seed_from_u64(seed));

        Self {
            device: model.embedding.weight.device(),
            model,
            vocab_size,
            ids: tokens.to_vec(),
            remaining: max_tokens,
            temperature,
            top_k,
            rng,
        }
    }

    /// Logits of the last position, on the host.
    fn last_step_logits(&self) -> Vec<f32> {
        let sequence = self.ids.len();
        let ids = self.ids.iter().map(|&t| t as i64).collect::<Vec<_>>();
        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [1, sequence]), &self.device);

        let logits = self.model.forward(ids);
        let last = logits.narrow(1, sequence - 1, 1).reshape([self.vocab_size]);
        last.into_data()
            .convert::<f32>()
            .to_vec()
            .expect("logits converted to f32")
    }
}

impl<'m, B: Backend> Iterator for TokenGenerator<'m, B> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let mut logits = self.last_step_logits();
        if let Some(top_k) = self.top_k {
            mask_below_top_k(&mut logits, top_k);
        }

        let next = match &mut self.rng {
            Some(rng) => {
                let probs = softmax_scaled(&logits, self.temperature);
                sample_multinomial(&probs, rng)
            }
            None => argmax(&logits),
        } as u32;

        self.ids.push(next);
        Some(next)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'m, B: Backend> ExactSizeIterator for TokenGenerator<'m, B> {}

/// Masks every logit strictly below the k-th largest to `-inf`. `k` is
/// clamped to the vocabulary size; ties at the threshold survive.
fn mask_below_top_k(logits: &mut [f32], top_k: usize) {
    let top_k = top_k.clamp(1, logits.len());
    let mut sorted = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[top_k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn softmax_scaled(logits: &[f32], temperature: f64) -> Vec<f32> {
    let scaled: Vec<f32> = logits
        .iter()
        .map(|&logit| (logit as f64 / temperature) as f32)
        .collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scaled.iter().map(|&logit| (logit - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

fn sample_multinomial(probs: &[f32], rng: &mut StdRng) -> usize {
    let draw: f32 = rng.random();
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return i;
        }
    }
    // rounding can leave a sliver above the last cumulative bucket
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len() - 1)
}

/// Index of the maximum, first occurrence on ties.
fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &logit) in logits.iter().enumerate() {
        if logit > logits[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_masks_below_threshold_and_clamps() {
        let mut logits = vec![1.0, 4.0, 2.0, 3.0];
        mask_below_top_k(&mut logits, 2);
        assert_eq!(logits, vec![f32::NEG_INFINITY, 4.0, f32::NEG_INFINITY, 3.0]);

        // larger than the vocabulary: keeps everything
        let mut logits = vec![1.0, 4.0, 2.0];
        mask_below_top_k(&mut logits, 100);
        assert_eq!(logits, vec![1.0, 4.0, 2.0]);
    }

    #[test]
    fn argmax_breaks_ties_on_first_occurrence() {
        assert_eq!(argmax(&[0.0, 3.0, 3.0, 1.0]), 1);
        assert_eq!(argmax(&[5.0]), 0);
    }

    #[test]
    fn multinomial_is_deterministic_under_a_seed() {
        let probs = vec![0.1, 0.2, 0.3, 0.4];
        let a: Vec<usize> = {
            let mut rng = StdRng::seed_from_u64(7);
            (0..32).map(|_| sample_multinomial(&probs, &mut rng)).collect()
        };
        let b: Vec<usize> = {
            let mut rng = StdRng::seed_from_u64(7);
            (0..32).map(|_| sample_multinomial(&probs, &mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn multinomial_never_selects_masked_probabilities() {
        // only index 2 has mass
        let probs = vec![0.0, 0.0, 1.0, 0.0];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..64 {
            assert_eq!(sample_multinomial(&probs, &mut rng), 2);
        }
    }
}
