//! Selective state-space sequence mixer.
//!
//! References:
//! - https://github.com/huggingface/candle/blob/fd7c8565646039e35925b8730d27ddad195d7e73/candle-examples/examples/mamba-minimal/
//! - https://github.com/johnma2006/mamba-minimal/blob/61f01953ca153f8c4a850d7111beecbf4be9cee1/

use crate::utils::dense_init;
use burn::module::Param;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Initializer, Linear, LinearConfig, PaddingConfig1d};
use burn::prelude::*;
use burn::tensor::activation::{silu, softplus};

/// One selective-scan mixer. Consumes and produces `[batch, sequence,
/// d_model]`; all temporal state lives inside a single forward call and is
/// re-derived from scratch on every invocation.
#[derive(Module, Debug)]
pub struct MambaBlock<B: Backend> {
    /// Input channel: d_model.
    /// Output channel: 2 * d_inner (stream and gate).
    pub in_proj: Linear<B>,

    /// Depthwise causal convolution over time, d_inner channels.
    pub conv1d: Conv1d<B>,

    /// Input channel: d_inner.
    /// Output channel: dt_rank + 2 * d_state.
    pub x_proj: Linear<B>,

    /// Input channel: dt_rank.
    /// Output channel: d_inner.
    pub dt_proj: Linear<B>,

    /// Dims: [d_inner, d_state].
    pub a_log: Param<Tensor<B, 2>>,

    /// Dims: [d_inner].
    pub d: Param<Tensor<B, 1>>,

    /// Input channel: d_inner.
    /// Output channel: d_model.
    pub out_proj: Linear<B>,
}

#[derive(Config, Debug)]
pub struct MambaBlockConfig {
    /// Hidden dimension of the surrounding residual stream.
    pub d_model: usize,

    /// Working width of the mixer.
    pub d_inner: usize,

    /// Latent state dimension per channel (`N` in Algorithm 2 from the Mamba
    /// paper).
    #[config(default = 16)]
    pub d_state: usize,

    /// Local convolution width.
    #[config(default = 4)]
    pub d_conv: usize,
}

impl MambaBlockConfig {
    /// Rank of Δ, the input-dependent step size.
    pub fn dt_rank(&self) -> usize {
        (self.d_model + self.d_state - 1) / self.d_state
    }

    /// Returns the initialized module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MambaBlock<B> {
        assert!(
            self.d_model >= 1 && self.d_inner >= 1 && self.d_state >= 1 && self.d_conv >= 1,
            "mixer dimensions must all be >= 1",
        );
        let d_inner = self.d_inner;
        let dt_rank = self.dt_rank();

        // the depthwise conv is not a dense map and keeps the fan-in uniform
        // initialization; fan_in = in_channels / groups * kernel_size
        let conv_init = {
            let bound = 1.0 / (self.d_conv as f64).sqrt();
            Initializer::Uniform {
                min: -bound,
                max: bound,
            }
        };

        let a_log = {
            let a_row: Tensor<B, 1> =
                Tensor::<B, 1, Int>::arange(1..self.d_state as i64 + 1, device).float();
            let a = a_row.unsqueeze::<2>().repeat(&[d_inner, 1]);
            debug_assert_eq!([d_inner, self.d_state], a.dims());
            Param::from_tensor(a.log())
        };

        MambaBlock {
            in_proj: LinearConfig::new(self.d_model, 2 * d_inner)
                .with_bias(false)
                .with_initializer(dense_init(self.d_model, 2 * d_inner))
                .init(device),
            conv1d: Conv1dConfig::new(d_inner, d_inner, self.d_conv)
                .with_padding(PaddingConfig1d::Explicit(self.d_conv - 1))
                .with_groups(d_inner)
                .with_bias(true)
                .with_initializer(conv_init)
                .init(device),
            x_proj: LinearConfig::new(d_inner, dt_rank + 2 * self.d_state)
                .with_bias(false)
                .with_initializer(dense_init(d_inner, dt_rank + 2 * self.d_state))
                .init(device),
            dt_proj: Linear {
                weight: dense_init(dt_rank, d_inner).init([dt_rank, d_inner], device),
                bias: Some(Initializer::Zeros.init([d_inner], device)),
            },
            a_log,
            d: Initializer::Ones.init([d_inner], device),
            out_proj: LinearConfig::new(d_inner, self.d_model)
                .with_bias(false)
                .with_initializer(dense_init(d_inner, self.d_model))
                .init(device),
        }
    }
}

impl<B: Backend> MambaBlock<B> {
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, sequence, d_model] = x.dims();
        let [d_inner] = self.d.dims();
        let [_, _, d_conv] = self.conv1d.weight.dims();

        // project d_model into a stream half and a gate half
        let (xs, res) = {
            let xs_and_res = self.in_proj.forward(x);
            debug_assert_eq!([batch, sequence, 2 * d_inner], xs_and_res.dims());

            let split = xs_and_res.split_with_sizes(vec![d_inner, d_inner], 2);
            (split[0].clone(), split[1].clone())
        };

        // causal conv over time: pad left by d_conv - 1, drop the tail
        let xs = {
            let xs = xs.movedim(1, 2);
            debug_assert_eq!([batch, d_inner, sequence], xs.dims());

            let xs = self.conv1d.forward(xs);
            debug_assert_eq!([batch, d_inner, sequence + d_conv - 1], xs.dims());

            let xs = xs.narrow(2, 0, sequence).movedim(1, 2);
            debug_assert_eq!([batch, sequence, d_inner], xs.dims());

            silu(xs)
        };

        let ss = self.ss(xs);
        debug_assert_eq!([batch, sequence, d_inner], ss.dims());

        let ys = ss * silu(res);

        let y = self.out_proj.forward(ys);
        debug_assert_eq!([batch, sequence, d_model], y.dims());

        y
    }

    /// Runs the state-space transform: computes the Δ A B C D parameters and
    /// scans over time.
    ///
    /// # Shapes
    ///   - Input [batch, sequence, d_inner]
    ///   - Output [batch, sequence, d_inner]
    pub fn ss(&self, u: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, sequence, d_inner] = u.dims();
        let [_, d_state] = self.a_log.dims();
        let [dt_rank, _] = self.dt_proj.weight.dims();

        // A is input-independent (see Section 3.5.2 "Interpretation of A"
        // from the Mamba paper)
        let a = self.a_log.val().exp().neg();
        debug_assert_eq!([d_inner, d_state], a.dims());

        // Δ, B and C are input-dependent
        let x_dbl = self.x_proj.forward(u.clone());
        debug_assert_eq!([batch, sequence, dt_rank + 2 * d_state], x_dbl.dims());

        let split = x_dbl.split_with_sizes(vec![dt_rank, d_state, d_state], 2);
        let delta = split[0].clone();
        let b = split[1].clone();
        let c = split[2].clone();

        let delta = softplus(self.dt_proj.forward(delta), 1.);
        debug_assert_eq!([batch, sequence, d_inner], delta.dims());

        let delta = delta.movedim(0, 1);
        let c = c.movedim(0, 1);
        debug_assert_eq!([sequence, batch, d_state], c.dims());

        Self::selective_scan(delta, a, b, c, self.d.val(), u)
    }

    /// Sequential selective scan (see Algorithm 2 in Section 3.2 from the
    /// Mamba paper, and run_SSM(A, B, C, u) from The Annotated S4). The
    /// official implementation replaces this with a hardware-aware parallel
    /// scan; the recurrence below is the plain linear-time form.
    ///
    /// # Shapes
    ///   - Input delta [sequence, batch, d_inner]
    ///   - Input a [d_inner, d_state]
    ///   - Input b [batch, sequence, d_state]
    ///   - Input c [sequence, batch, d_state]
    ///   - Input d [d_inner]
    ///   - Input u [batch, sequence, d_inner]
    ///   - Output [batch, sequence, d_inner]
    pub fn selective_scan(
        delta: Tensor<B, 3>,
        a: Tensor<B, 2>,
        b: Tensor<B, 3>,
        c: Tensor<B, 3>,
        d: Tensor<B, 1>,
        u: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let device = &u.device();
        let [sequence, batch, d_inner] = delta.dims();
        let [_, d_state] = a.dims();
        let outer_shape = [sequence, batch, d_inner, d_state];

        // Discretize the continuous parameters: A by zero-order hold, B by
        // the simplified Euler rule (per a discussion with the Mamba authors,
        // "A is the more important term and the performance doesn't change
        // much with the simplification on B").
        let (delta_a, delta_bu) = {
            let delta = delta.unsqueeze_dim::<4>(3).expand(outer_shape);
            let a = a.unsqueeze_dims::<4>(&[0, 1]).expand(outer_shape);
            let delta_a = (delta.clone() * a).exp();

            let b = b.movedim(1, 0).unsqueeze_dim::<4>(2).expand(outer_shape);
            let u = u
                .clone()
                .movedim(0, 1)
                .unsqueeze_dim::<4>(3)
                .expand(outer_shape);
            let delta_bu = delta * b * u;

            (delta_a, delta_bu)
        };
        debug_assert_eq!(outer_shape, delta_a.dims());
        debug_assert_eq!(outer_shape, delta_bu.dims());

        // unstack the sequence axis and run the recurrence
        let delta_a = delta_a.split(1, 0);
        let delta_bu = delta_bu.split(1, 0);
        let c = c.unsqueeze_dim::<4>(3).split(1, 0);
        debug_assert_eq!(c.len(), sequence);

        let inner_shape = [batch, d_inner, d_state];
        let mut state: Tensor<B, 3> = Tensor::zeros(inner_shape, device);
        let mut ys = Vec::with_capacity(sequence);
        for ((delta_a, delta_bu), c) in delta_a
            .into_iter()
            .zip(delta_bu.into_iter())
            .zip(c.into_iter())
        {
            let delta_a = delta_a.squeeze::<3>(0);
            let delta_bu = delta_bu.squeeze::<3>(0);
            let c = c.squeeze::<3>(0);
            debug_assert_eq!([batch, d_state, 1], c.dims());

            state = (state.clone() * delta_a) + delta_bu;
            let y = state.clone().matmul(c);
            debug_assert_eq!([batch, d_inner, 1], y.dims());
            ys.push(y.squeeze::<2>(2));
        }

        let ys = Tensor::stack::<3>(ys, 1);
        debug_assert_eq!([batch, sequence, d_inner], ys.dims());

        // skip connection through the input
        let d = d
            .unsqueeze_dims::<3>(&[0, 1])
            .expand([batch, sequence, d_inner]);
        ys + (d * u)
    }
}
