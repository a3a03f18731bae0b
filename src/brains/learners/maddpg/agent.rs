use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer};
use rand::Rng;

use crate::{
    brains::{
        learners::utils::{adam, clip_grad_norm},
        models::{
            mlp::{MlpActor, MlpCritic},
            CopyWeights, CriticWithTarget, Policy, PolicyWithTarget, ValueEstimator,
        },
    },
    envs::{AgentId, DimInfo},
    hparams::MaddpgParams,
    MaddpgError, Result,
};

/// One agent's actor and centralized critic, their targets and optimizers.
pub struct MaddpgAgent {
    pub id: AgentId,
    pub dims: DimInfo,
    pub actor: PolicyWithTarget<MlpActor>,
    pub critic: CriticWithTarget<MlpCritic>,
    actor_vars: Vec<Var>,
    critic_vars: Vec<Var>,
    actor_optim: AdamW,
    critic_optim: AdamW,
    grad_clip: f64,
}

impl MaddpgAgent {
    pub fn new(
        id: AgentId,
        dims: DimInfo,
        joint_obs_dim: usize,
        joint_act_dim: usize,
        params: &MaddpgParams,
    ) -> Result<Self> {
        let hidden = params.hidden_dim;
        let actor = PolicyWithTarget::new(
            MlpActor::new(dims.obs_dim, hidden, dims.act_dim)?,
            MlpActor::new(dims.obs_dim, hidden, dims.act_dim)?,
        )?;
        let critic = CriticWithTarget::new(
            MlpCritic::new(joint_obs_dim, joint_act_dim, hidden)?,
            MlpCritic::new(joint_obs_dim, joint_act_dim, hidden)?,
        )?;
        let actor_vars = actor.policy.varmap().all_vars();
        let critic_vars = critic.critic.varmap().all_vars();
        let actor_optim = adam(actor_vars.clone(), params.actor_lr)?;
        let critic_optim = adam(critic_vars.clone(), params.critic_lr)?;
        Ok(Self {
            id,
            dims,
            actor,
            critic,
            actor_vars,
            critic_vars,
            actor_optim,
            critic_optim,
            grad_clip: params.grad_clip,
        })
    }

    /// Live-actor action for a `[batch, obs_dim]` observation: the
    /// differentiable one-hot sample and the raw logits.
    pub fn action<R: Rng + ?Sized>(&self, obs: &Tensor, rng: &mut R) -> Result<(Tensor, Tensor)> {
        Ok(self.actor.policy.act(obs, rng)?)
    }

    pub fn target_action<R: Rng + ?Sized>(&self, obs: &Tensor, rng: &mut R) -> Result<Tensor> {
        Ok(self.actor.act_target(obs, rng)?.detach())
    }

    /// Critic value over the joint batch; `obs` and `act` list every agent in
    /// registry order.
    pub fn critic_value(&self, obs: &[Tensor], act: &[Tensor]) -> Result<Tensor> {
        let obs = Tensor::cat(obs, 1)?;
        let act = Tensor::cat(act, 1)?;
        Ok(self.critic.estimate_value(&obs, &act)?)
    }

    pub fn target_critic_value(&self, obs: &[Tensor], act: &[Tensor]) -> Result<Tensor> {
        let obs = Tensor::cat(obs, 1)?;
        let act = Tensor::cat(act, 1)?;
        Ok(self.critic.estimate_target_value(&obs, &act)?.detach())
    }

    fn check_norm(&self, what: &'static str, norm: f32) -> Result<f32> {
        if norm.is_finite() {
            Ok(norm)
        } else {
            Err(MaddpgError::NumericDivergence {
                agent: self.id.to_string(),
                what,
                value: norm,
            })
        }
    }

    /// One clipped gradient step on the live critic. Returns the gradient
    /// norm before clipping; a non-finite norm fails before the step.
    pub fn update_critic(&mut self, loss: &Tensor) -> Result<f32> {
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&self.critic_vars, &mut grads, self.grad_clip)?;
        let norm = self.check_norm("critic gradient norm", norm)?;
        self.critic_optim.step(&grads)?;
        Ok(norm)
    }

    /// One clipped gradient step on the live actor. The critic's optimizer is
    /// not touched even though the loss flows through it.
    pub fn update_actor(&mut self, loss: &Tensor) -> Result<f32> {
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&self.actor_vars, &mut grads, self.grad_clip)?;
        let norm = self.check_norm("actor gradient norm", norm)?;
        self.actor_optim.step(&grads)?;
        Ok(norm)
    }

    pub fn soft_update(&self, tau: f64) -> Result<()> {
        self.actor.soft_update(tau)?;
        self.critic.soft_update(tau)?;
        Ok(())
    }

    pub fn sync_targets(&self) -> Result<()> {
        self.actor.sync_target()?;
        self.critic.sync_target()?;
        Ok(())
    }
}
