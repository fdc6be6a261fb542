use burn::module::Module;
use burn::nn::loss::Reduction;
use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn::tensor::activation::log_softmax;

/// Target id excluded from the loss.
pub const IGNORE_INDEX: i64 = -1;

/// Cross-entropy over the vocabulary axis with an ignore sentinel.
///
/// Positions whose target equals [`IGNORE_INDEX`] contribute nothing to the
/// loss and are excluded from the mean's denominator. The mean over a batch
/// where every position is ignored is defined as exactly zero.
#[derive(Module, Clone, Debug, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Create the criterion.
    pub fn new() -> Self {
        Self
    }

    /// Compute the criterion on the input tensor.
    ///
    /// # Shapes
    ///   - logits: [num_positions, vocab_size]
    ///   - targets: [num_positions], values in `[-1, vocab_size)`
    ///   - output: [1]
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let kept = targets.clone().not_equal_elem(IGNORE_INDEX);
        let loss = self.forward_no_reduction(logits, targets);
        match reduction {
            Reduction::Mean | Reduction::Auto => {
                let count = kept.int().sum().float().clamp_min(1.0);
                loss.sum() / count
            }
            Reduction::Sum => loss.sum(),
        }
    }

    /// Compute the criterion on the input tensor without reducing. Ignored
    /// positions come out as exact zeros.
    ///
    /// # Shapes
    ///   - logits: [num_positions, vocab_size]
    ///   - targets: [num_positions]
    ///   - output: [num_positions]
    pub fn forward_no_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [num_positions, vocab_size] = logits.dims();
        let [num_targets] = targets.dims();
        assert_eq!(
            num_positions, num_targets,
            "cross-entropy: {num_positions} logit rows but {num_targets} targets",
        );
        assert_targets_in_range(&targets, vocab_size);

        let ignored = targets.clone().equal_elem(IGNORE_INDEX);
        // gather still needs a real row index at ignored positions
        let index = targets.clamp_min(0);

        let log_probs = log_softmax(logits, 1);
        let loss = log_probs
            .gather(1, index.unsqueeze_dim(1))
            .squeeze(1)
            .neg();
        loss.mask_fill(ignored, 0.0)
    }
}

fn assert_targets_in_range<B: Backend>(targets: &Tensor<B, 1, Int>, vocab_size: usize) {
    let below: i64 = targets
        .clone()
        .lower_elem(IGNORE_INDEX)
        .int()
        .sum()
        .into_scalar()
        .elem();
    let above: i64 = targets
        .clone()
        .greater_equal_elem(vocab_size as i64)
        .int()
        .sum()
        .into_scalar()
        .elem();
    assert!(
        below == 0 && above == 0,
        "cross-entropy: targets must lie in [-1, {vocab_size})",
    );
}
