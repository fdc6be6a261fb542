use burn::LearningRate;
use burn::module::AutodiffModule;
use burn::optim::SimpleOptimizer;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;

/// Momentum optimizer with orthogonalized updates for matrix parameters.
///
/// Gradients are folded into a momentum buffer; the (nesterov-blended)
/// update is flattened to two dimensions, orthogonalized by a fixed number
/// of Newton-Schulz iterations and applied with an aspect-ratio step scale.
/// Parameters with fewer than two dimensions skip the orthogonalization and
/// take the plain momentum update.
#[derive(Clone)]
pub struct Muon {
    momentum: f64,
    nesterov: bool,
    ns_steps: usize,
}

#[derive(Config, Debug)]
pub struct MuonConfig {
    #[config(default = 0.95)]
    pub momentum: f64,

    #[config(default = true)]
    pub nesterov: bool,

    /// Newton-Schulz iterations per step.
    #[config(default = 5)]
    pub ns_steps: usize,
}

impl MuonConfig {
    /// Initialize the optimizer.
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<Muon, M, B> {
        OptimizerAdaptor::from(Muon {
            momentum: self.momentum,
            nesterov: self.nesterov,
            ns_steps: self.ns_steps,
        })
    }
}

/// State of [`Muon`] for one parameter.
#[derive(Record, Clone)]
pub struct MuonState<B: Backend, const D: usize> {
    pub momentum: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Muon {
    type State<const D: usize> = MuonState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let momentum = match state {
            Some(state) => {
                state.momentum * self.momentum + grad.clone() * (1.0 - self.momentum)
            }
            None => grad.clone() * (1.0 - self.momentum),
        };

        let update = if self.nesterov {
            grad * (1.0 - self.momentum) + momentum.clone() * self.momentum
        } else {
            momentum.clone()
        };

        let update = if D >= 2 {
            self.orthogonalized(update)
        } else {
            update
        };

        let tensor = tensor - update * lr;
        (tensor, Some(MuonState { momentum }))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.momentum = state.momentum.to_device(device);
        state
    }
}

impl Muon {
    /// Flattens trailing dimensions, orthogonalizes, scales by
    /// `sqrt(max(1, rows/cols))` and restores the shape.
    fn orthogonalized<B: Backend, const D: usize>(&self, update: Tensor<B, D>) -> Tensor<B, D> {
        let dims: [usize; D] = update.dims();
        let rows = dims[0];
        let cols = dims[1..].iter().product::<usize>();

        let flat = update.reshape([rows, cols]);
        let ortho = newton_schulz(flat, self.ns_steps);

        let scale = f64::max(1.0, rows as f64 / cols as f64).sqrt();
        (ortho * scale).reshape(dims)
    }
}

/// Approximates the nearest semi-orthogonal matrix with the quintic
/// Newton-Schulz iteration, iterating on the wide orientation.
fn newton_schulz<B: Backend>(g: Tensor<B, 2>, steps: usize) -> Tensor<B, 2> {
    const A: f64 = 3.4445;
    const B_COEF: f64 = -4.7750;
    const C: f64 = 2.0315;

    let [rows, cols] = g.dims();
    let tall = rows > cols;
    let mut x = if tall { g.transpose() } else { g };

    let norm = x.clone().powi_scalar(2).sum().sqrt() + 1e-7;
    x = x / norm.reshape([1, 1]);

    for _ in 0..steps {
        let a = x.clone().matmul(x.clone().transpose());
        let b = a.clone() * B_COEF + a.clone().matmul(a) * C;
        x = x.clone() * A + b.matmul(x);
    }

    if tall { x.transpose() } else { x }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray;

    fn muon() -> Muon {
        Muon {
            momentum: 0.95,
            nesterov: true,
            ns_steps: 5,
        }
    }

    fn to_vec(tensor: Tensor<TestBackend, 2>) -> Vec<f32> {
        tensor.into_data().convert::<f32>().to_vec().unwrap()
    }

    #[test]
    fn a_zero_gradient_leaves_the_parameter_unchanged() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 2> =
            Tensor::random([4, 6], Distribution::Default, &device);
        let grad = Tensor::zeros([4, 6], &device);

        let (updated, state) = muon().step(0.02, tensor.clone(), grad, None);
        assert_eq!(to_vec(updated), to_vec(tensor));
        assert!(state.is_some());
    }

    #[test]
    fn a_nonzero_gradient_moves_the_parameter_and_stays_finite() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 2> =
            Tensor::random([4, 6], Distribution::Default, &device);
        let grad: Tensor<TestBackend, 2> =
            Tensor::random([4, 6], Distribution::Normal(0.0, 1.0), &device);

        let (updated, _state) = muon().step(0.02, tensor.clone(), grad, None);
        let before = to_vec(tensor);
        let after = to_vec(updated);
        assert!(after.iter().all(|v| v.is_finite()));
        assert_ne!(before, after);
    }

    #[test]
    fn one_dimensional_parameters_take_the_plain_momentum_update() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 1> = Tensor::zeros([8], &device);
        let grad: Tensor<TestBackend, 1> = Tensor::ones([8], &device);

        let (updated, _state) = muon().step(1.0, tensor, grad, None);
        // nesterov blend of a fresh buffer: (1-m) + m(1-m) applied at lr 1
        let expected = -(1.0f32 - 0.95) * (1.0 + 0.95);
        let values: Vec<f32> = updated.into_data().convert::<f32>().to_vec().unwrap();
        for value in values {
            assert!((value - expected).abs() < 1e-6);
        }
    }
}
