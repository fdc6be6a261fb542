use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::cast::ToElement;
use burn::tensor::{DType, Element, ElementConversion};

pub mod loss;

/// A safe epsilon for divisions, between the dtype's smallest positive
/// normal and its machine epsilon (log-average of their exponents).
pub fn div_eps_f32<B: Backend>() -> f32 {
    match <B::FloatElem as Element>::dtype() {
        // 4.0693917e-16
        DType::F64 => {
            let raw_exp = -(-f64::MIN_EXP as f32 * 2.3f32).powf(0.35f32);
            let eps_exp = (f64::EPSILON as f32).log10();
            10f32.powf((raw_exp + eps_exp) / 2f32)
        }
        // 8.1584695e-8
        DType::F32 | DType::Flex32 => {
            let raw_exp = -(-f32::MIN_EXP as f32 * 2.3f32).powf(0.35f32);
            let eps_exp = f32::EPSILON.log10();
            10f32.powf((raw_exp + eps_exp) / 2f32)
        }
        // 7.1209995e-4
        DType::F16 => {
            let raw_exp = -(-burn::tensor::f16::MIN_EXP.to_f32() * 2.3f32).powf(0.35f32);
            let eps_exp = burn::tensor::f16::EPSILON.to_f32().log10();
            10f32.powf((raw_exp + eps_exp) / 2f32)
        }
        // 2.0885676e-5
        DType::BF16 => {
            let raw_exp = -(-burn::tensor::bf16::MIN_EXP.to_f32() * 2.3f32).powf(0.35f32);
            let eps_exp = burn::tensor::bf16::EPSILON.to_f32().log10();
            10f32.powf((raw_exp + eps_exp) / 2f32)
        }
        DType::I64
        | DType::I32
        | DType::I16
        | DType::I8
        | DType::U64
        | DType::U32
        | DType::U16
        | DType::U8
        | DType::Bool => {
            unreachable!()
        }
        DType::QFloat(_) => {
            unimplemented!()
        }
    }
}

pub fn div_eps<B: Backend>() -> B::FloatElem {
    div_eps_f32::<B>().elem()
}

/// Root-mean-square normalization over the last axis, with no learnable
/// scale. An all-zero vector normalizes to all zeros.
///
/// # Shapes
///   - Input [..., d]
///   - Output [..., d]
pub fn rms_norm<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let rms = x.clone().powi_scalar(2).mean_dim(D - 1).sqrt();
    x / (rms + div_eps::<B>())
}

/// Initializer for dense maps: zero-mean normal with
/// `std = 1/√fan_in · min(1, √(fan_out/fan_in))`, so maps that shrink the
/// feature count also shrink their output variance.
pub fn dense_init(fan_in: usize, fan_out: usize) -> Initializer {
    let std = (fan_in as f64).powf(-0.5) * f64::min(1.0, (fan_out as f64 / fan_in as f64).sqrt());
    Initializer::Normal { mean: 0.0, std }
}
