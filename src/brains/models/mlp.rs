use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};

use crate::brains::learners::{utils::linear, DEVICE};

use super::{CopyWeights, Policy, ValueEstimator};

const RELU_GAIN: f64 = std::f64::consts::SQRT_2;

fn build(in_len: usize, hidden_len: usize, out_len: usize, vs: VarBuilder) -> Result<Vec<Linear>> {
    Ok(vec![
        linear(in_len, hidden_len, RELU_GAIN, vs.pp("l0"))?,
        linear(hidden_len, hidden_len, RELU_GAIN, vs.pp("l1"))?,
        linear(hidden_len, out_len, 1.0, vs.pp("l2"))?,
    ])
}

fn forward(layers: &[Linear], x: &Tensor) -> Result<Tensor> {
    let n_layers = layers.len();
    let mut x = x.clone();
    for layer in layers[..n_layers - 1].iter() {
        x = layer.forward(&x)?.relu()?;
    }
    layers[n_layers - 1].forward(&x)
}

/// Two hidden ReLU layers from one agent's observation to action logits.
pub struct MlpActor {
    pub layers: Vec<Linear>,
    pub varmap: VarMap,
}

impl MlpActor {
    pub fn new(obs_len: usize, hidden_len: usize, action_len: usize) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &DEVICE);
        let layers = build(obs_len, hidden_len, action_len, vs)?;
        Ok(Self { layers, varmap })
    }
}

impl Policy for MlpActor {
    fn action_logits(&self, obs: &Tensor) -> Result<Tensor> {
        forward(&self.layers, obs)
    }
}

impl CopyWeights for MlpActor {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// Centralized critic over the concatenated observations and actions of
/// every agent.
pub struct MlpCritic {
    pub layers: Vec<Linear>,
    pub varmap: VarMap,
}

impl MlpCritic {
    pub fn new(joint_obs_len: usize, joint_action_len: usize, hidden_len: usize) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &DEVICE);
        let layers = build(joint_obs_len + joint_action_len, hidden_len, 1, vs)?;
        Ok(Self { layers, varmap })
    }
}

impl ValueEstimator for MlpCritic {
    fn estimate_value(&self, obs: &Tensor, action: &Tensor) -> Result<Tensor> {
        let x = Tensor::cat(&[obs, action], 1)?;
        forward(&self.layers, &x)?.squeeze(1)
    }
}

impl CopyWeights for MlpCritic {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_logit_shape() -> Result<()> {
        let actor = MlpActor::new(4, 32, 3)?;
        let obs = Tensor::randn(0f32, 1.0, (5, 4), &DEVICE)?;
        assert_eq!(actor.action_logits(&obs)?.dims(), &[5, 3]);
        Ok(())
    }

    #[test]
    fn critic_value_per_row() -> Result<()> {
        let critic = MlpCritic::new(8, 6, 32)?;
        let obs = Tensor::randn(0f32, 1.0, (5, 8), &DEVICE)?;
        let act = Tensor::zeros((5, 6), DType::F32, &DEVICE)?;
        assert_eq!(critic.estimate_value(&obs, &act)?.dims(), &[5]);
        Ok(())
    }

    #[test]
    fn variable_names_are_stable() {
        let actor = MlpActor::new(4, 8, 3).unwrap();
        let mut names = actor.named_tensors().unwrap().into_iter().map(|(n, _)| n).collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            vec!["l0.bias", "l0.weight", "l1.bias", "l1.weight", "l2.bias", "l2.weight"]
        );
    }
}
