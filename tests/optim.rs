use burn::nn::loss::Reduction;
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::TensorData;
use burn_mamba_lm::model::{MambaLm, MambaLmConfig};
use burn_mamba_lm::optim::{DistInfo, LmOptimizerConfig, OptimStrategy, ParamRole};

type TestAutodiffBackend = burn::backend::Autodiff<burn::backend::NdArray>;

fn ids_tensor(rows: Vec<Vec<i64>>) -> Tensor<TestAutodiffBackend, 2, Int> {
    let batch = rows.len();
    let sequence = rows[0].len();
    let flat: Vec<i64> = rows.into_iter().flatten().collect();
    Tensor::from_data(TensorData::new(flat, [batch, sequence]), &Default::default())
}

#[test]
fn parameter_groups_partition_the_model_exactly() {
    let device = Default::default();
    TestAutodiffBackend::seed(0);
    let model: MambaLm<TestAutodiffBackend> = MambaLmConfig::new()
        .with_n_layer(2)
        .with_n_embd(768)
        .with_vocab_size(512)
        .init(&device);

    let optimizers = LmOptimizerConfig::new().init(&model, &DistInfo::default());

    let grouped: usize = optimizers.groups().iter().map(|g| g.num_params).sum();
    assert_eq!(grouped, model.num_params());

    let groups = optimizers.groups();
    assert_eq!(groups.len(), 3);
    for (i, a) in groups.iter().enumerate() {
        for b in groups.iter().skip(i + 1) {
            assert_eq!(a.ids.intersection(&b.ids).count(), 0);
        }
    }
}

#[test]
fn learning_rates_scale_with_model_width_and_anchor_their_initial_value() {
    let device = Default::default();
    TestAutodiffBackend::seed(1);

    // at the reference width the scale is exactly one
    let model: MambaLm<TestAutodiffBackend> = MambaLmConfig::new()
        .with_n_layer(1)
        .with_n_embd(768)
        .with_vocab_size(128)
        .init(&device);
    let optimizers = LmOptimizerConfig::new().init(&model, &DistInfo::default());
    for group in optimizers.groups() {
        let expected = match group.role {
            ParamRole::Unembedding => 0.004,
            ParamRole::Embedding => 0.2,
            ParamRole::Matrix => 0.02,
        };
        assert!((group.lr - expected).abs() < 1e-12);
        assert_eq!(group.lr, group.initial_lr);
    }

    // a quarter of the width doubles the adaptive learning rates only
    let model: MambaLm<TestAutodiffBackend> = MambaLmConfig::new()
        .with_n_layer(1)
        .with_n_embd(192)
        .with_vocab_size(128)
        .init(&device);
    let mut optimizers = LmOptimizerConfig::new().init(&model, &DistInfo::default());
    for group in optimizers.groups() {
        let expected = match group.role {
            ParamRole::Unembedding => 0.008,
            ParamRole::Embedding => 0.4,
            ParamRole::Matrix => 0.02,
        };
        assert!((group.lr - expected).abs() < 1e-12);
    }

    // schedules rescale from the assembly-time anchor
    optimizers.set_lr_factor(0.5);
    optimizers.set_lr_factor(0.25);
    for group in optimizers.groups() {
        assert!((group.lr - group.initial_lr * 0.25).abs() < 1e-12);
    }
}

#[test]
fn topology_selects_the_optimizer_strategy() {
    let device = Default::default();
    let model: MambaLm<TestAutodiffBackend> = MambaLmConfig::new()
        .with_n_layer(1)
        .with_n_embd(64)
        .with_vocab_size(64)
        .init(&device);

    let single = LmOptimizerConfig::new().init(&model, &DistInfo::default());
    assert_eq!(*single.strategy(), OptimStrategy::SingleProcess);

    let dist = DistInfo {
        is_distributed: true,
        rank: 1,
        local_rank: 1,
        world_size: 4,
    };
    let multi = LmOptimizerConfig::new().init(&model, &dist);
    assert_eq!(
        *multi.strategy(),
        OptimStrategy::MultiProcess {
            rank: 1,
            world_size: 4
        }
    );
}

#[test]
fn a_training_step_updates_the_head_and_keeps_parameters_finite() {
    let device = Default::default();
    TestAutodiffBackend::seed(2);
    let model: MambaLm<TestAutodiffBackend> = MambaLmConfig::new()
        .with_sequence_len(16)
        .with_vocab_size(50)
        .with_n_layer(1)
        .with_n_embd(32)
        .with_d_state(4)
        .with_d_conv(2)
        .init(&device);
    let mut optimizers = LmOptimizerConfig::new().init(&model, &DistInfo::default());

    let ids = ids_tensor(vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
    let targets = ids_tensor(vec![vec![2, 3, 4, 5], vec![6, 7, 8, 9]]);

    let mut model = model;
    for _ in 0..2 {
        let loss = model.forward_loss(ids.clone(), targets.clone(), Reduction::Mean);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizers.step(model, grads);
    }

    let head: Vec<f32> = model
        .lm_head
        .weight
        .val()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .unwrap();
    assert!(head.iter().all(|w| w.is_finite()));
    assert!(head.iter().any(|w| *w != 0.0));

    let embedding: Vec<f32> = model
        .embedding
        .weight
        .val()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .unwrap();
    assert!(embedding.iter().all(|w| w.is_finite()));
}
