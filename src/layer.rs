#[cfg(feature = "mamba")]
use crate::mamba_block::{MambaBlock, MambaBlockConfig};
use crate::utils::{dense_init, rms_norm};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// Sequence-mixing strategy, fixed when the layer is built. Both variants
/// share one contract (`[batch, sequence, d_model]` in and out), and nothing
/// outside this module inspects which variant is installed.
#[derive(Module, Debug)]
pub enum SequenceMixer<B: Backend> {
    /// Selective state-space mixer.
    #[cfg(feature = "mamba")]
    Mamba(MambaBlock<B>),
    /// Dense per-position map, installed when the selective mixer is
    /// unavailable.
    Dense(Linear<B>),
}

impl<B: Backend> SequenceMixer<B> {
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            #[cfg(feature = "mamba")]
            SequenceMixer::Mamba(block) => block.forward(x),
            SequenceMixer::Dense(linear) => linear.forward(x),
        }
    }
}

/// One residual stage: a sequence-mixing sub-layer and a position-wise
/// feed-forward sub-layer, each behind pre-normalization.
#[derive(Module, Debug)]
pub struct MixerLayer<B: Backend> {
    pub mixer: SequenceMixer<B>,
    pub mlp: Mlp<B>,
}

#[derive(Config, Debug)]
pub struct MixerLayerConfig {
    pub d_model: usize,

    /// Working width of the sequence mixer.
    pub d_inner: usize,

    #[config(default = 16)]
    pub d_state: usize,

    #[config(default = 4)]
    pub d_conv: usize,
}

impl MixerLayerConfig {
    /// Returns the initialized layer.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MixerLayer<B> {
        MixerLayer {
            mixer: self.init_mixer(device),
            mlp: MlpConfig::new(self.d_model).init(device),
        }
    }

    #[cfg(feature = "mamba")]
    fn init_mixer<B: Backend>(&self, device: &B::Device) -> SequenceMixer<B> {
        SequenceMixer::Mamba(
            MambaBlockConfig::new(self.d_model, self.d_inner)
                .with_d_state(self.d_state)
                .with_d_conv(self.d_conv)
                .init(device),
        )
    }

    #[cfg(not(feature = "mamba"))]
    fn init_mixer<B: Backend>(&self, device: &B::Device) -> SequenceMixer<B> {
        static FALLBACK_WARNING: std::sync::Once = std::sync::Once::new();
        FALLBACK_WARNING.call_once(|| {
            log::warn!("selective mixer unavailable, using a dense linear mixer");
        });
        SequenceMixer::Dense(
            LinearConfig::new(self.d_model, self.d_model)
                .with_bias(false)
                .with_initializer(dense_init(self.d_model, self.d_model))
                .init(device),
        )
    }
}

impl<B: Backend> MixerLayer<B> {
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, sequence, d_model] = x.dims();

        let res = x.clone();
        let x = self.mixer.forward(rms_norm(x)) + res;

        let res = x.clone();
        let x = self.mlp.forward(rms_norm(x)) + res;
        debug_assert_eq!([batch, sequence, d_model], x.dims());

        x
    }
}

/// Position-wise feed-forward sub-layer: expand to 4x the embedding width,
/// gate with SiLU, project back.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    /// Input channel: d_model.
    /// Output channel: 4 * d_model.
    pub c_fc: Linear<B>,

    /// Input channel: 4 * d_model.
    /// Output channel: d_model. Zeroed at initialization so every residual
    /// stage starts as the identity.
    pub c_proj: Linear<B>,
}

#[derive(Config, Debug)]
pub struct MlpConfig {
    pub d_model: usize,
}

impl MlpConfig {
    /// Returns the initialized module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            c_fc: LinearConfig::new(self.d_model, 4 * self.d_model)
                .with_bias(false)
                .with_initializer(dense_init(self.d_model, 4 * self.d_model))
                .init(device),
            c_proj: LinearConfig::new(4 * self.d_model, self.d_model)
                .with_bias(false)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }
}

impl<B: Backend> Mlp<B> {
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.c_proj.forward(silu(self.c_fc.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn both_mixer_variants_preserve_the_activation_shape() {
        let device = Default::default();
        let x: Tensor<TestBackend, 3> =
            Tensor::random([2, 5, 16], Distribution::Default, &device);

        let layer = MixerLayerConfig::new(16, 32)
            .with_d_state(4)
            .with_d_conv(2)
            .init::<TestBackend>(&device);
        assert_eq!([2, 5, 16], layer.mixer.forward(x.clone()).dims());

        let dense = SequenceMixer::Dense(
            LinearConfig::new(16, 16)
                .with_bias(false)
                .with_initializer(dense_init(16, 16))
                .init(&device),
        );
        assert_eq!([2, 5, 16], dense.forward(x).dims());
    }

    #[test]
    fn a_layer_with_zeroed_projections_is_the_identity_for_the_mlp_branch() {
        let device = Default::default();
        let layer = MixerLayerConfig::new(8, 16)
            .with_d_state(4)
            .with_d_conv(2)
            .init::<TestBackend>(&device);

        let x: Tensor<TestBackend, 3> =
            Tensor::random([1, 3, 8], Distribution::Default, &device);
        let out = layer.mlp.forward(x);

        let values: Vec<f32> = out.into_data().convert::<f32>().to_vec().unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }
}
