mod muon;

pub use muon::{Muon, MuonConfig, MuonState};

use crate::model::MambaLm;
use burn::module::{ModuleVisitor, ParamId};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamW, AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::collections::HashSet;
use std::marker::PhantomData;

/// Process-topology descriptor supplied by the launcher.
#[derive(Clone, Debug)]
pub struct DistInfo {
    pub is_distributed: bool,
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl Default for DistInfo {
    fn default() -> Self {
        Self {
            is_distributed: false,
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }
}

/// How optimizer updates relate to other training processes. Gradient
/// exchange itself is an external collaborator; the multi-process strategy
/// records the topology the assembly was built for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptimStrategy {
    SingleProcess,
    MultiProcess { rank: usize, world_size: usize },
}

/// Which optimizer a parameter group is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamRole {
    /// Output projection, stepped by AdamW.
    Unembedding,
    /// Token embedding table, stepped by AdamW.
    Embedding,
    /// Everything inside the layer stack, stepped by Muon.
    Matrix,
}

/// A disjoint slice of the trainable parameters with its own learning rate.
#[derive(Clone, Debug)]
pub struct ParamGroup {
    pub role: ParamRole,
    pub ids: HashSet<ParamId>,
    pub num_params: usize,
    pub lr: f64,
    /// Snapshot taken at assembly time; schedules rescale from this anchor,
    /// never from the mutated `lr`.
    pub initial_lr: f64,
}

#[derive(Config, Debug)]
pub struct LmOptimizerConfig {
    #[config(default = 0.004)]
    pub unembedding_lr: f64,

    #[config(default = 0.2)]
    pub embedding_lr: f64,

    #[config(default = 0.02)]
    pub matrix_lr: f64,

    #[config(default = 0.0)]
    pub weight_decay: f64,
}

impl LmOptimizerConfig {
    /// Builds the two-optimizer assembly for `model`: AdamW over the
    /// embedding table and the output projection (learning rates scaled by
    /// `(n_embd/768)^-0.5`), Muon over every parameter of the layer stack.
    ///
    /// Panics unless the three groups partition the model's parameters
    /// exactly.
    pub fn init<B: AutodiffBackend>(&self, model: &MambaLm<B>, dist: &DistInfo) -> LmOptimizers<B> {
        let [_, d_model] = model.embedding.weight.dims();

        // wider models take proportionally smaller adaptive steps
        let dmodel_lr_scale = (d_model as f64 / 768.0).powf(-0.5);
        if dist.rank == 0 {
            log::info!(
                "scaling unembedding/embedding learning rates by (d_model/768)^-0.5 = {dmodel_lr_scale:.6}",
            );
        }

        let groups = vec![
            collect_group(
                ParamRole::Unembedding,
                &model.lm_head,
                self.unembedding_lr * dmodel_lr_scale,
            ),
            collect_group(
                ParamRole::Embedding,
                &model.embedding,
                self.embedding_lr * dmodel_lr_scale,
            ),
            collect_group(ParamRole::Matrix, &model.layers, self.matrix_lr),
        ];
        assert_partition(model, &groups);

        let strategy = if dist.is_distributed {
            OptimStrategy::MultiProcess {
                rank: dist.rank,
                world_size: dist.world_size,
            }
        } else {
            OptimStrategy::SingleProcess
        };

        let adamw = AdamWConfig::new()
            .with_beta_1(0.8)
            .with_beta_2(0.95)
            .with_epsilon(1e-10)
            .with_weight_decay(self.weight_decay as f32)
            .init::<B, MambaLm<B>>();
        let muon = MuonConfig::new().init::<B, MambaLm<B>>();

        LmOptimizers {
            adamw,
            muon,
            groups,
            strategy,
        }
    }
}

/// The two cooperating optimizers and their parameter-group partition.
pub struct LmOptimizers<B: AutodiffBackend> {
    adamw: OptimizerAdaptor<AdamW, MambaLm<B>, B>,
    muon: OptimizerAdaptor<Muon, MambaLm<B>, B>,
    groups: Vec<ParamGroup>,
    strategy: OptimStrategy,
}

impl<B: AutodiffBackend> LmOptimizers<B> {
    /// Applies one optimization step, routing every group's gradient slice
    /// to its optimizer at the group's current learning rate.
    pub fn step(&mut self, mut model: MambaLm<B>, grads: GradientsParams) -> MambaLm<B> {
        let LmOptimizers {
            adamw,
            muon,
            groups,
            ..
        } = self;

        let mut grads = grads;
        for group in groups.iter() {
            let group_grads = extract_group_grads(&model, &mut grads, &group.ids);
            model = match group.role {
                ParamRole::Unembedding | ParamRole::Embedding => {
                    adamw.step(group.lr, model, group_grads)
                }
                ParamRole::Matrix => muon.step(group.lr, model, group_grads),
            };
        }
        model
    }

    /// Rescales every group's learning rate relative to its assembly-time
    /// anchor.
    pub fn set_lr_factor(&mut self, factor: f64) {
        for group in self.groups.iter_mut() {
            group.lr = group.initial_lr * factor;
        }
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn strategy(&self) -> &OptimStrategy {
        &self.strategy
    }
}

struct ParamCollector<B: Backend> {
    ids: HashSet<ParamId>,
    num_params: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> ParamCollector<B> {
    fn new() -> Self {
        Self {
            ids: HashSet::new(),
            num_params: 0,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.ids.insert(id);
        self.num_params += tensor.shape().num_elements();
    }
}

fn collect_group<B: Backend, M: Module<B>>(role: ParamRole, module: &M, lr: f64) -> ParamGroup {
    let mut collector = ParamCollector::<B>::new();
    module.visit(&mut collector);
    ParamGroup {
        role,
        ids: collector.ids,
        num_params: collector.num_params,
        lr,
        initial_lr: lr,
    }
}

fn assert_partition<B: AutodiffBackend>(model: &MambaLm<B>, groups: &[ParamGroup]) {
    let mut seen = HashSet::new();
    let mut total = 0;
    for group in groups {
        for id in group.ids.iter() {
            assert!(
                seen.insert(*id),
                "parameter {id:?} assigned to more than one optimizer group",
            );
        }
        total += group.num_params;
    }

    let mut all = ParamCollector::<B>::new();
    model.visit(&mut all);
    assert_eq!(
        (seen.len(), total),
        (all.ids.len(), all.num_params),
        "optimizer groups must cover every parameter exactly once",
    );
}

struct GradFilter<'a, B: AutodiffBackend> {
    ids: &'a HashSet<ParamId>,
    source: &'a mut GradientsParams,
    filtered: GradientsParams,
    _backend: PhantomData<B>,
}

impl<'a, B: AutodiffBackend> ModuleVisitor<B> for GradFilter<'a, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.ids.contains(&id) {
            return;
        }
        if let Some(grad) = self.source.remove::<B::InnerBackend, D>(id) {
            self.filtered.register(id, grad);
        }
    }
}

fn extract_group_grads<B: AutodiffBackend>(
    model: &MambaLm<B>,
    grads: &mut GradientsParams,
    ids: &HashSet<ParamId>,
) -> GradientsParams {
    let mut filter = GradFilter::<B> {
        ids,
        source: grads,
        filtered: GradientsParams::new(),
        _backend: PhantomData,
    };
    model.visit(&mut filter);
    filter.filtered
}
