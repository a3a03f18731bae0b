use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::VarMap;
use rand::Rng;

use crate::brains::learners::utils::gumbel_softmax;

pub mod mlp;

pub trait Policy {
    fn action_logits(&self, obs: &Tensor) -> Result<Tensor>;

    /// Samples a differentiable one-hot action. Returns `(action, logits)`.
    fn act<R: Rng + ?Sized>(&self, obs: &Tensor, rng: &mut R) -> Result<(Tensor, Tensor)> {
        let logits = self.action_logits(obs)?;
        let action = gumbel_softmax(&logits, 1.0, rng)?;
        Ok((action, logits))
    }
}

pub trait ValueEstimator {
    /// Value of each row of the joint observation/action batch, shape `[batch]`.
    fn estimate_value(&self, obs: &Tensor, action: &Tensor) -> Result<Tensor>;
}

fn lock(data: &Mutex<HashMap<String, Var>>) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    data.lock()
        .map_err(|_| Error::Msg("variable map lock poisoned".to_owned()))
}

/// Parameter plumbing shared by every network that keeps a target copy.
pub trait CopyWeights {
    fn varmap(&self) -> &VarMap;

    /// `self <- tau * other + (1 - tau) * self`
    fn soft_update(&self, other: &Self, tau: f64) -> Result<()> {
        let mine = lock(self.varmap().data())?;
        let theirs = lock(other.varmap().data())?;
        for (varname, my_var) in mine.iter() {
            let other_var = theirs
                .get(varname)
                .ok_or_else(|| Error::Msg(format!("no variable {varname} in source network")))?;
            let new_var = my_var
                .affine(1.0 - tau, 0.0)?
                .add(&other_var.affine(tau, 0.0)?)?;
            my_var.set(&new_var)?;
        }
        Ok(())
    }

    fn hard_update(&self, other: &Self) -> Result<()> {
        let mine = lock(self.varmap().data())?;
        let theirs = lock(other.varmap().data())?;
        for (varname, my_var) in mine.iter() {
            let other_var = theirs
                .get(varname)
                .ok_or_else(|| Error::Msg(format!("no variable {varname} in source network")))?;
            my_var.set(&other_var.as_tensor().copy()?)?;
        }
        Ok(())
    }

    /// Euclidean distance between the two parameter sets.
    fn distance(&self, other: &Self) -> Result<f32> {
        let mine = lock(self.varmap().data())?;
        let theirs = lock(other.varmap().data())?;
        let mut total = 0.0f32;
        for (varname, my_var) in mine.iter() {
            let other_var = theirs
                .get(varname)
                .ok_or_else(|| Error::Msg(format!("no variable {varname} in source network")))?;
            total += (my_var.as_tensor() - other_var.as_tensor())?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
        }
        Ok(total.sqrt())
    }

    /// Named snapshot of the current parameters.
    fn named_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        let mine = lock(self.varmap().data())?;
        let mut out = mine
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Overwrites every parameter from `lookup`, which must yield a tensor of
    /// matching shape for each variable name.
    fn load_named(&self, mut lookup: impl FnMut(&str) -> Option<Tensor>) -> Result<()> {
        let mine = lock(self.varmap().data())?;
        for (varname, my_var) in mine.iter() {
            let t = lookup(varname)
                .ok_or_else(|| Error::Msg(format!("missing tensor for {varname}")))?;
            if t.dims() != my_var.dims() {
                return Err(Error::Msg(format!(
                    "tensor {varname} has shape {:?}, expected {:?}",
                    t.dims(),
                    my_var.dims()
                )));
            }
            my_var.set(&t)?;
        }
        Ok(())
    }
}

/// Live policy plus its slowly tracking target. The two never share storage.
pub struct PolicyWithTarget<P: Policy + CopyWeights> {
    pub policy: P,
    pub target_policy: P,
}

impl<P: Policy + CopyWeights> PolicyWithTarget<P> {
    pub fn new(policy: P, target_policy: P) -> Result<Self> {
        target_policy.hard_update(&policy)?;
        Ok(Self {
            policy,
            target_policy,
        })
    }

    pub fn soft_update(&self, tau: f64) -> Result<()> {
        self.target_policy.soft_update(&self.policy, tau)
    }

    pub fn sync_target(&self) -> Result<()> {
        self.target_policy.hard_update(&self.policy)
    }

    pub fn act_target<R: Rng + ?Sized>(&self, obs: &Tensor, rng: &mut R) -> Result<Tensor> {
        Ok(self.target_policy.act(obs, rng)?.0)
    }
}

impl<P: Policy + CopyWeights> Policy for PolicyWithTarget<P> {
    fn action_logits(&self, obs: &Tensor) -> Result<Tensor> {
        self.policy.action_logits(obs)
    }
}

pub struct CriticWithTarget<V: ValueEstimator + CopyWeights> {
    pub critic: V,
    pub target_critic: V,
}

impl<V: ValueEstimator + CopyWeights> CriticWithTarget<V> {
    pub fn new(critic: V, target_critic: V) -> Result<Self> {
        target_critic.hard_update(&critic)?;
        Ok(Self {
            critic,
            target_critic,
        })
    }

    pub fn soft_update(&self, tau: f64) -> Result<()> {
        self.target_critic.soft_update(&self.critic, tau)
    }

    pub fn sync_target(&self) -> Result<()> {
        self.target_critic.hard_update(&self.critic)
    }

    pub fn estimate_target_value(&self, obs: &Tensor, action: &Tensor) -> Result<Tensor> {
        self.target_critic.estimate_value(obs, action)
    }
}

impl<V: ValueEstimator + CopyWeights> ValueEstimator for CriticWithTarget<V> {
    fn estimate_value(&self, obs: &Tensor, action: &Tensor) -> Result<Tensor> {
        self.critic.estimate_value(obs, action)
    }
}

#[cfg(test)]
mod tests {
    use super::mlp::{MlpActor, MlpCritic};
    use super::*;
    use crate::brains::learners::DEVICE;

    fn actor_pair() -> Result<PolicyWithTarget<MlpActor>> {
        PolicyWithTarget::new(MlpActor::new(4, 16, 3)?, MlpActor::new(4, 16, 3)?)
    }

    fn perturb(net: &impl CopyWeights, by: f64) -> Result<()> {
        for var in net.varmap().all_vars() {
            let shifted = var.as_tensor().affine(1.0, by)?;
            var.set(&shifted)?;
        }
        Ok(())
    }

    #[test]
    fn target_starts_as_exact_copy() -> Result<()> {
        let actor = actor_pair()?;
        assert_eq!(actor.policy.distance(&actor.target_policy)?, 0.0);
        let obs = Tensor::ones((2, 4), candle_core::DType::F32, &DEVICE)?;
        let live = actor.policy.action_logits(&obs)?.to_vec2::<f32>()?;
        let target = actor.target_policy.action_logits(&obs)?.to_vec2::<f32>()?;
        assert_eq!(live, target);
        Ok(())
    }

    #[test]
    fn target_does_not_alias_live() -> Result<()> {
        let actor = actor_pair()?;
        perturb(&actor.policy, 1.0)?;
        assert!(actor.policy.distance(&actor.target_policy)? > 0.0);
        Ok(())
    }

    #[test]
    fn soft_update_boundaries() -> Result<()> {
        let actor = actor_pair()?;
        perturb(&actor.policy, 0.5)?;
        let gap = actor.policy.distance(&actor.target_policy)?;

        actor.soft_update(0.0)?;
        assert_eq!(actor.policy.distance(&actor.target_policy)?, gap);

        actor.soft_update(1.0)?;
        assert_eq!(actor.policy.distance(&actor.target_policy)?, 0.0);
        Ok(())
    }

    #[test]
    fn soft_update_moves_target_toward_live() -> Result<()> {
        let critic = CriticWithTarget::new(MlpCritic::new(8, 6, 16)?, MlpCritic::new(8, 6, 16)?)?;
        perturb(&critic.critic, 1.0)?;
        let before = critic.critic.distance(&critic.target_critic)?;
        critic.soft_update(0.02)?;
        let after = critic.critic.distance(&critic.target_critic)?;
        assert!((after - before * 0.98).abs() < 1e-3 * before);
        Ok(())
    }

    #[test]
    fn load_named_rejects_wrong_shape() -> Result<()> {
        let actor = MlpActor::new(4, 16, 3)?;
        let bad = Tensor::zeros(7, candle_core::DType::F32, &DEVICE)?;
        assert!(actor.load_named(|_| Some(bad.clone())).is_err());
        Ok(())
    }
}
