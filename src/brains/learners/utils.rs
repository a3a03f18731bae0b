use candle_core::{backprop::GradStore, DType, Error, Result, Tensor, Var, D};
use candle_nn::{AdamW, Linear, Optimizer, ParamsAdamW, VarBuilder};
use rand::Rng;
use rand_distr::{Distribution, Gumbel};

use super::DEVICE;

/// Adam without decoupled weight decay.
pub fn adam(vars: Vec<Var>, lr: f64) -> Result<AdamW> {
    AdamW::new(
        vars,
        ParamsAdamW {
            lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
}

pub fn linear(in_len: usize, out_len: usize, gain: f64, vs: VarBuilder) -> Result<Linear> {
    let w_init = candle_nn::init::Init::Kaiming {
        dist: candle_nn::init::NormalOrUniform::Normal,
        fan: candle_nn::init::FanInOut::FanIn,
        non_linearity: candle_nn::init::NonLinearity::ExplicitGain(gain),
    };
    let b_init = candle_nn::init::Init::Const(0.0);
    let weight = vs.get_with_hints((out_len, in_len), "weight", w_init)?;
    let bias = vs.get_with_hints((out_len,), "bias", b_init)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Rows of `indices` expanded to one-hot vectors of width `n`.
pub fn one_hot(indices: &Tensor, n: usize) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, n as u32, indices.device())?;
    indices
        .to_dtype(DType::U32)?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)
}

pub fn one_hot_vec(index: usize, n: usize) -> Box<[f32]> {
    let mut v = vec![0.0f32; n];
    v[index] = 1.0;
    v.into_boxed_slice()
}

/// Hard Gumbel-softmax over the last dim of `logits`. The forward value is a
/// one-hot sample, the gradient is that of the soft sample.
pub fn gumbel_softmax<R: Rng + ?Sized>(
    logits: &Tensor,
    temperature: f64,
    rng: &mut R,
) -> Result<Tensor> {
    let gumbel = Gumbel::new(0.0f32, 1.0).map_err(|e| Error::Msg(e.to_string()))?;
    let noise = (0..logits.elem_count())
        .map(|_| gumbel.sample(rng))
        .collect::<Vec<_>>();
    let noise = Tensor::from_vec(noise, logits.shape(), logits.device())?;
    // `softmax_last_dim` is a fused op without a backward pass.
    let y_soft =
        candle_nn::ops::softmax(&(logits + noise)?.affine(1.0 / temperature, 0.0)?, D::Minus1)?;
    let n = *logits.dims().last().unwrap_or(&1);
    let y_hard = one_hot(&y_soft.argmax_keepdim(D::Minus1)?, n)?;
    (y_hard - y_soft.detach())?.add(&y_soft)
}

/// Rescales the gradients of `vars` in place so their joint L2 norm is at
/// most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f32> {
    let mut total = 0.0f32;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let norm = total.sqrt();
    let scale = max_norm / (norm as f64 + 1e-6);
    if scale < 1.0 {
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

pub fn batch_tensor(rows: Vec<f32>, width: usize) -> Result<Tensor> {
    let n = if width == 0 { 0 } else { rows.len() / width };
    Tensor::from_vec(rows, (n, width), &DEVICE)
}
