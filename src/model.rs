use crate::generate::TokenGenerator;
use crate::layer::{MixerLayer, MixerLayerConfig};
use crate::utils::loss::CrossEntropyLoss;
use crate::utils::rms_norm;
use burn::nn::loss::Reduction;
use burn::nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::ElementConversion;

/// Symmetric bound applied to the logits: `cap * tanh(logits / cap)` keeps
/// every logit inside `[-cap, cap]` without a hard-clip discontinuity.
pub const LOGIT_SOFTCAP: f64 = 15.0;

/// Autoregressive language model over a stack of sequence-mixing layers.
#[derive(Module, Debug)]
pub struct MambaLm<B: Backend> {
    pub embedding: Embedding<B>,
    pub layers: Vec<MixerLayer<B>>,
    /// Zeroed at initialization so initial logits are exactly zero.
    pub lm_head: Linear<B>,
    pub sequence_len: usize,
    pub d_state: usize,
}

#[derive(Config, Debug)]
pub struct MambaLmConfig {
    /// Training context length. Only the flops estimate consumes this; the
    /// forward pass accepts any sequence length.
    #[config(default = 1024)]
    pub sequence_len: usize,

    #[config(default = 50304)]
    pub vocab_size: usize,

    #[config(default = 12)]
    pub n_layer: usize,

    #[config(default = 768)]
    pub n_embd: usize,

    /// State expansion factor of the sequence mixer.
    #[config(default = 16)]
    pub d_state: usize,

    /// Local convolution width of the sequence mixer.
    #[config(default = 4)]
    pub d_conv: usize,

    /// Block expansion factor: each mixer works at `d_inner = expand * n_embd`.
    #[config(default = 2)]
    pub expand: usize,
}

impl MambaLmConfig {
    pub fn d_inner(&self) -> usize {
        self.expand * self.n_embd
    }

    /// Returns the initialized model.
    ///
    /// Every dense map draws from a fan-aware scaled normal and the token
    /// embedding from a unit normal, except that the output projection and
    /// each layer's final feed-forward projection start at exactly zero, so
    /// the residual stream is the identity and all logits are zero until the
    /// first optimizer step.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MambaLm<B> {
        assert!(
            self.sequence_len >= 1
                && self.vocab_size >= 1
                && self.n_layer >= 1
                && self.n_embd >= 1
                && self.d_state >= 1
                && self.d_conv >= 1
                && self.expand >= 1,
            "model hyperparameters must all be >= 1",
        );

        let layer_config = MixerLayerConfig::new(self.n_embd, self.d_inner())
            .with_d_state(self.d_state)
            .with_d_conv(self.d_conv);
        let mut layers = Vec::with_capacity(self.n_layer);
        for _ in 0..self.n_layer {
            layers.push(layer_config.init(device));
        }

        MambaLm {
            embedding: EmbeddingConfig::new(self.vocab_size, self.n_embd)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 1.0,
                })
                .init(device),
            layers,
            lm_head: LinearConfig::new(self.n_embd, self.vocab_size)
                .with_bias(false)
                .with_initializer(Initializer::Zeros)
                .init(device),
            sequence_len: self.sequence_len,
            d_state: self.d_state,
        }
    }
}

impl<B: Backend> MambaLm<B> {
    /// Capped next-token logits for every position.
    ///
    /// # Shapes
    ///   - Input [batch, sequence]
    ///   - Output [batch, sequence, vocab_size], every value in
    ///     `[-LOGIT_SOFTCAP, LOGIT_SOFTCAP]`
    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, sequence] = ids.dims();
        let [vocab_size, d_model] = self.embedding.weight.dims();
        assert_ids_in_vocab(&ids, vocab_size);

        let mut x = rms_norm(self.embedding.forward(ids));
        debug_assert_eq!([batch, sequence, d_model], x.dims());

        // strict sequential stack: each layer consumes the previous output
        for layer in self.layers.iter() {
            x = layer.forward(x);
        }
        let x = rms_norm(x);

        let logits = self.lm_head.forward(x);
        debug_assert_eq!([batch, sequence, vocab_size], logits.dims());

        (logits / LOGIT_SOFTCAP).tanh() * LOGIT_SOFTCAP
    }

    /// Cross-entropy of the next-token predictions against `targets`, with
    /// `-1` positions excluded. The mean reduction averages over non-ignored
    /// positions and is exactly zero when every position is ignored.
    ///
    /// # Shapes
    ///   - Input ids [batch, sequence]
    ///   - Input targets [batch, sequence], values in `[-1, vocab_size)`
    ///   - Output [1]
    pub fn forward_loss(
        &self,
        ids: Tensor<B, 2, Int>,
        targets: Tensor<B, 2, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let [batch, sequence] = ids.dims();
        let [t_batch, t_sequence] = targets.dims();
        assert_eq!(
            [batch, sequence],
            [t_batch, t_sequence],
            "ids dims {:?} do not match targets dims {:?}",
            [batch, sequence],
            [t_batch, t_sequence],
        );

        let logits = self.forward(ids);
        let [_, _, vocab_size] = logits.dims();

        CrossEntropyLoss::new().forward(
            logits.reshape([batch * sequence, vocab_size]),
            targets.reshape([batch * sequence]),
            reduction,
        )
    }

    /// Lazily samples up to `max_tokens` continuation ids for `tokens`.
    ///
    /// `temperature <= 0` selects greedily; otherwise sampling is driven by a
    /// generator seeded from `seed`. See [`TokenGenerator`].
    pub fn generate<'m>(
        &'m self,
        tokens: &[u32],
        max_tokens: usize,
        temperature: f64,
        top_k: Option<usize>,
        seed: u64,
    ) -> TokenGenerator<'m, B> {
        TokenGenerator::new(self, tokens, max_tokens, temperature, top_k, seed)
    }

    /// Estimated floating-point operations per token, from the closed-form
    /// cost of the scan, the feed-forward maps and the remaining parameters.
    /// Advisory only.
    pub fn estimate_flops(&self) -> f64 {
        let n_params = self.num_params();
        let n_params_embedding = self.embedding.weight.shape().num_elements();
        let [_, d_model] = self.embedding.weight.dims();
        let (l, t) = (self.layers.len(), self.sequence_len);

        let ssm_flops = (l * d_model * self.d_state * t * 6) as f64;
        let mlp_flops = (l * d_model * 4 * d_model * 2) as f64;
        (ssm_flops + mlp_flops) / t as f64 + (6 * (n_params - n_params_embedding)) as f64 / t as f64
    }
}

fn assert_ids_in_vocab<B: Backend>(ids: &Tensor<B, 2, Int>, vocab_size: usize) {
    if ids.shape().num_elements() == 0 {
        return;
    }
    let min: i64 = ids.clone().min().into_scalar().elem();
    let max: i64 = ids.clone().max().into_scalar().elem();
    assert!(
        min >= 0 && max < vocab_size as i64,
        "token ids must lie in [0, {vocab_size}), got range [{min}, {max}]",
    );
}
