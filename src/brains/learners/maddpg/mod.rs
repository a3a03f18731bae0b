use candle_core::{Tensor, D};
use itertools::Itertools;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    brains::{
        learners::utils::one_hot_vec,
        models::Policy,
    },
    envs::{AgentId, AgentMap, DimInfo, Env, JointTransition, StepResult},
    hparams::MaddpgParams,
    MaddpgError, Result, TbWriter,
};

use self::{
    agent::MaddpgAgent,
    replay_buffer::{sample_indices, ReplayBuffer, Sample},
};

use super::{Status, DEVICE};

pub mod agent;
pub mod checkpoint;
pub mod replay_buffer;

#[derive(Debug, Clone, Copy, Default)]
pub struct MaddpgStatus {
    pub policy_loss: f32,
    pub value_loss: f32,
    /// Mean pre-clipping gradient norms.
    pub policy_grad_norm: f32,
    pub value_grad_norm: f32,
    pub learn_steps: usize,
}

impl Status for MaddpgStatus {
    fn log(&self, writer: &mut TbWriter, step: usize) {
        writer.add_scalar("Policy/Loss", self.policy_loss, step);
        writer.add_scalar("Value/Loss", self.value_loss, step);
        writer.add_scalar("Policy/GradNorm", self.policy_grad_norm, step);
        writer.add_scalar("Value/GradNorm", self.value_grad_norm, step);
    }
}

fn finite(agent: &AgentId, what: &'static str, loss: &Tensor) -> Result<f32> {
    let value = loss.to_scalar::<f32>()?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MaddpgError::NumericDivergence {
            agent: agent.to_string(),
            what,
            value,
        })
    }
}

/// Owns every agent and its replay buffer. Buffers are written in lockstep so
/// slot `k` holds the same timestep for all agents.
pub struct Maddpg {
    pub params: MaddpgParams,
    pub status: MaddpgStatus,
    agents: Vec<MaddpgAgent>,
    buffers: Vec<ReplayBuffer>,
    rng: ChaCha8Rng,
}

impl Maddpg {
    pub fn new(ids: Vec<AgentId>, dims: Vec<DimInfo>, params: MaddpgParams) -> Result<Self> {
        params.validate()?;
        if ids.len() != dims.len() {
            return Err(MaddpgError::dims("agent dimension info", ids.len(), dims.len()));
        }
        if let Some((a, b)) = ids.iter().sorted().tuple_windows().find(|(a, b)| a == b) {
            return Err(MaddpgError::InvalidParams(format!(
                "duplicate agent ids {a} and {b}"
            )));
        }
        let joint_obs_dim = dims.iter().map(|d| d.obs_dim).sum();
        let joint_act_dim = dims.iter().map(|d| d.act_dim).sum();
        let agents = ids
            .into_iter()
            .zip(dims.iter())
            .map(|(id, d)| MaddpgAgent::new(id, *d, joint_obs_dim, joint_act_dim, &params))
            .collect::<Result<Vec<_>>>()?;
        let buffers = dims
            .iter()
            .map(|d| ReplayBuffer::new(params.buffer_capacity, d.obs_dim, d.act_dim))
            .collect::<Result<Vec<_>>>()?;
        let rng = match params.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        tracing::debug!(
            agents = agents.len(),
            joint_obs_dim,
            joint_act_dim,
            "built maddpg"
        );
        Ok(Self {
            params,
            status: MaddpgStatus::default(),
            agents,
            buffers,
            rng,
        })
    }

    pub fn from_env(env: &impl Env, params: MaddpgParams) -> Result<Self> {
        Self::new(env.possible_agents().to_vec(), env.dim_info(), params)
    }

    /// Fails if `env` disagrees with the dimensions this learner was built for.
    pub fn check_env(&self, env: &impl Env) -> Result<()> {
        if env.num_agents() != self.agents.len() {
            return Err(MaddpgError::dims("agent count", self.agents.len(), env.num_agents()));
        }
        for (agent, (id, dims)) in self
            .agents
            .iter()
            .zip(env.possible_agents().iter().zip(env.dim_info()))
        {
            if agent.id != *id {
                return Err(MaddpgError::UnknownAgent(id.to_string()));
            }
            if agent.dims.obs_dim != dims.obs_dim {
                return Err(MaddpgError::dims(
                    format!("{id} observation"),
                    agent.dims.obs_dim,
                    dims.obs_dim,
                ));
            }
            if agent.dims.act_dim != dims.act_dim {
                return Err(MaddpgError::dims(
                    format!("{id} action"),
                    agent.dims.act_dim,
                    dims.act_dim,
                ));
            }
        }
        Ok(())
    }

    pub fn num_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &AgentId> + '_ {
        self.agents.iter().map(|a| &a.id)
    }

    pub fn agents(&self) -> &[MaddpgAgent] {
        &self.agents
    }

    pub fn buffers(&self) -> &[ReplayBuffer] {
        &self.buffers
    }

    pub fn index_of(&self, id: &AgentId) -> Result<usize> {
        self.agents
            .iter()
            .position(|a| a.id == *id)
            .ok_or_else(|| MaddpgError::UnknownAgent(id.to_string()))
    }

    /// Number of timesteps every buffer can serve.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(ReplayBuffer::len).min().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn obs_tensor(&self, i: usize, obs: &[f32]) -> Result<Tensor> {
        let dims = self.agents[i].dims;
        if obs.len() != dims.obs_dim {
            return Err(MaddpgError::dims(
                format!("{} observation", self.agents[i].id),
                dims.obs_dim,
                obs.len(),
            ));
        }
        Ok(Tensor::from_slice(obs, (1, dims.obs_dim), &DEVICE)?)
    }

    /// Decentralized execution: each present agent samples from its own live
    /// actor given only its own observation.
    pub fn select_action(&mut self, obs: &AgentMap<Box<[f32]>>) -> Result<Vec<Option<usize>>> {
        if obs.len() != self.agents.len() {
            return Err(MaddpgError::dims("joint observation", self.agents.len(), obs.len()));
        }
        let mut out = Vec::with_capacity(obs.len());
        for (i, o) in obs.iter().enumerate() {
            let Some(o) = o else {
                out.push(None);
                continue;
            };
            let o = self.obs_tensor(i, o)?;
            let (action, _) = self.agents[i].action(&o, &mut self.rng)?;
            let a = action.argmax(D::Minus1)?.to_vec1::<u32>()?[0];
            out.push(Some(a as usize));
        }
        Ok(out)
    }

    /// Argmax of the live actors' logits, without exploration noise.
    pub fn select_greedy_action(&self, obs: &AgentMap<Box<[f32]>>) -> Result<Vec<Option<usize>>> {
        if obs.len() != self.agents.len() {
            return Err(MaddpgError::dims("joint observation", self.agents.len(), obs.len()));
        }
        obs.iter()
            .enumerate()
            .map(|(i, o)| match o {
                Some(o) => {
                    let o = self.obs_tensor(i, o)?;
                    let logits = self.agents[i].actor.action_logits(&o)?;
                    Ok(Some(logits.argmax(D::Minus1)?.to_vec1::<u32>()?[0] as usize))
                }
                None => Ok(None),
            })
            .collect()
    }

    /// Stores one joint timestep. Every slice is validated before any buffer
    /// is written, so a rejected transition leaves the buffers aligned.
    pub fn add(&mut self, t: &JointTransition) -> Result<()> {
        let n = self.agents.len();
        for (what, len) in [
            ("observations", t.obs.len()),
            ("actions", t.actions.len()),
            ("rewards", t.rewards.len()),
            ("next observations", t.next_obs.len()),
            ("dones", t.dones.len()),
        ] {
            if len != n {
                return Err(MaddpgError::dims(what, n, len));
            }
        }
        let actions = self
            .agents
            .iter()
            .zip(t.actions.iter())
            .map(|(agent, &a)| {
                if a >= agent.dims.act_dim {
                    Err(MaddpgError::dims(
                        format!("{} action index", agent.id),
                        agent.dims.act_dim,
                        a,
                    ))
                } else {
                    Ok(one_hot_vec(a, agent.dims.act_dim))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        for (i, buf) in self.buffers.iter().enumerate() {
            buf.check(&t.obs[i], &actions[i], &t.next_obs[i])?;
        }
        for (i, buf) in self.buffers.iter_mut().enumerate() {
            buf.add(&t.obs[i], &actions[i], t.rewards[i], &t.next_obs[i], t.dones[i])?;
        }
        Ok(())
    }

    /// Stores the transition produced by one env step, handling agents that
    /// already left per `params.inactive_agents`. Returns whether anything
    /// was stored.
    pub fn add_env_step(
        &mut self,
        obs: &AgentMap<Box<[f32]>>,
        actions: &[Option<usize>],
        step: &StepResult,
    ) -> Result<bool> {
        let dims = self.agents.iter().map(|a| a.dims).collect_vec();
        match JointTransition::collect(&dims, obs, actions, step, self.params.inactive_agents)? {
            Some(t) => {
                self.add(&t)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn sample(&mut self, batch_size: usize) -> Result<Vec<Sample>> {
        let len = self.len();
        if len < batch_size {
            return Err(MaddpgError::BufferUnderflow { len, batch_size });
        }
        let indices = sample_indices(&mut self.rng, len, batch_size)?;
        self.buffers.iter().map(|b| b.sample(&indices)).collect()
    }

    /// One centralized training step for every agent on a single shared
    /// batch. The target actors' next actions are computed once up front.
    pub fn learn(&mut self, batch_size: usize, gamma: f64) -> Result<MaddpgStatus> {
        let batch = self.sample(batch_size)?;
        let obs = batch.iter().map(|s| s.obs.clone()).collect_vec();
        let act = batch.iter().map(|s| s.action.clone()).collect_vec();
        let next_obs = batch.iter().map(|s| s.next_obs.clone()).collect_vec();
        let mut next_act = Vec::with_capacity(self.agents.len());
        for (agent, o) in self.agents.iter().zip(next_obs.iter()) {
            next_act.push(agent.target_action(o, &mut self.rng)?);
        }

        let logits_reg = self.params.logits_reg;
        let mut total_pl = 0.0f32;
        let mut total_vl = 0.0f32;
        let mut total_pg = 0.0f32;
        let mut total_vg = 0.0f32;
        for (i, agent) in self.agents.iter_mut().enumerate() {
            let current_q = agent.critic_value(&obs, &act)?;
            let next_q = agent.target_critic_value(&next_obs, &next_act)?;
            let target_q = batch[i]
                .done
                .affine(-gamma, gamma)?
                .mul(&next_q)?
                .add(&batch[i].reward)?
                .detach();
            let value_loss = (current_q - target_q)?.sqr()?.mean_all()?;
            total_vl += finite(&agent.id, "critic loss", &value_loss)?;
            total_vg += agent.update_critic(&value_loss)?;

            let (action_i, logits_i) = agent.action(&obs[i], &mut self.rng)?;
            let mut joint = act.clone();
            joint[i] = action_i;
            let policy_loss = agent
                .critic_value(&obs, &joint)?
                .mean_all()?
                .neg()?
                .add(&logits_i.sqr()?.mean_all()?.affine(logits_reg, 0.0)?)?;
            total_pl += finite(&agent.id, "actor loss", &policy_loss)?;
            total_pg += agent.update_actor(&policy_loss)?;
        }

        let n = self.agents.len().max(1) as f32;
        self.status = MaddpgStatus {
            policy_loss: total_pl / n,
            value_loss: total_vl / n,
            policy_grad_norm: total_pg / n,
            value_grad_norm: total_vg / n,
            learn_steps: self.status.learn_steps + 1,
        };
        tracing::debug!(
            policy_loss = self.status.policy_loss,
            value_loss = self.status.value_loss,
            value_grad_norm = self.status.value_grad_norm,
            "learn step {}",
            self.status.learn_steps
        );
        Ok(self.status)
    }

    /// `target <- tau * live + (1 - tau) * target` for every actor and critic.
    pub fn update_target(&mut self, tau: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&tau) {
            return Err(MaddpgError::InvalidParams(format!(
                "tau must lie in [0, 1], got {tau}"
            )));
        }
        for agent in self.agents.iter() {
            agent.soft_update(tau)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brains::models::CopyWeights;
    use crate::envs::simple_tag::{SimpleTag, SimpleTagParams};

    fn two_agents(capacity: usize) -> Maddpg {
        Maddpg::new(
            vec![AgentId::from("adversary_0"), AgentId::from("agent_0")],
            vec![
                DimInfo {
                    obs_dim: 4,
                    act_dim: 3,
                };
                2
            ],
            MaddpgParams {
                buffer_capacity: capacity,
                batch_size: 5,
                hidden_dim: 16,
                seed: Some(42),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn transition(t: usize) -> JointTransition {
        JointTransition {
            obs: vec![vec![t as f32; 4].into_boxed_slice(); 2],
            actions: vec![t % 3, (t + 1) % 3],
            rewards: vec![t as f32, -(t as f32)],
            next_obs: vec![vec![t as f32 + 1.0; 4].into_boxed_slice(); 2],
            dones: vec![false, t % 4 == 0],
        }
    }

    fn critic_snapshot(m: &Maddpg) -> Vec<Vec<(String, Vec<f32>)>> {
        m.agents()
            .iter()
            .map(|a| {
                a.critic
                    .critic
                    .named_tensors()
                    .unwrap()
                    .into_iter()
                    .map(|(n, t)| (n, t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn end_to_end_two_agents() -> Result<()> {
        let mut m = two_agents(10);
        for t in 0..10 {
            m.add(&transition(t))?;
        }
        assert_eq!(m.len(), 10);
        m.add(&transition(10))?;
        assert_eq!(m.len(), 10);
        for buf in m.buffers() {
            assert!((0..buf.len()).all(|i| buf.get(i).unwrap().obs[0] != 0.0));
        }

        let before = critic_snapshot(&m);
        let status = m.learn(5, 0.99)?;
        let after = critic_snapshot(&m);
        for (b, a) in before.iter().zip(after.iter()) {
            assert_ne!(b, a);
        }
        assert!(status.value_loss.is_finite());
        assert_eq!(status.learn_steps, 1);
        Ok(())
    }

    #[test]
    fn buffers_stay_aligned() -> Result<()> {
        let mut m = two_agents(6);
        for t in 0..13 {
            m.add(&transition(t))?;
        }
        let (a, b) = (&m.buffers()[0], &m.buffers()[1]);
        for i in 0..a.len() {
            assert_eq!(a.get(i).unwrap().obs, b.get(i).unwrap().obs);
        }
        Ok(())
    }

    #[test]
    fn rejected_add_leaves_buffers_untouched() {
        let mut m = two_agents(10);
        let mut bad = transition(1);
        bad.next_obs[1] = vec![0.0; 5].into_boxed_slice();
        assert!(matches!(
            m.add(&bad),
            Err(MaddpgError::DimensionMismatch { .. })
        ));
        bad = transition(1);
        bad.actions[0] = 3;
        assert!(m.add(&bad).is_err());
        assert!(m.buffers().iter().all(ReplayBuffer::is_empty));
    }

    #[test]
    fn learn_moves_actors_through_the_critic() -> Result<()> {
        let mut m = two_agents(10);
        m.params.logits_reg = 0.0;
        for t in 0..10 {
            m.add(&transition(t))?;
        }
        m.learn(5, 0.99)?;
        for agent in m.agents() {
            assert!(agent.actor.policy.distance(&agent.actor.target_policy)? > 0.0);
        }
        assert!(m.status.policy_grad_norm > 0.0);
        Ok(())
    }

    #[test]
    fn nan_reward_is_fatal_and_leaves_critics_alone() -> Result<()> {
        let mut m = two_agents(10);
        for t in 0..10 {
            let mut tr = transition(t);
            tr.rewards = vec![f32::NAN; 2];
            m.add(&tr)?;
        }
        assert!(matches!(
            m.learn(5, 0.99),
            Err(MaddpgError::NumericDivergence {
                what: "critic loss",
                ..
            })
        ));
        for agent in m.agents() {
            assert_eq!(agent.critic.critic.distance(&agent.critic.target_critic)?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn learn_refuses_to_underflow() {
        let mut m = two_agents(10);
        for t in 0..4 {
            m.add(&transition(t)).unwrap();
        }
        assert!(matches!(
            m.learn(5, 0.99),
            Err(MaddpgError::BufferUnderflow {
                len: 4,
                batch_size: 5
            })
        ));
    }

    #[test]
    fn learn_leaves_targets_alone_until_update() -> Result<()> {
        let mut m = two_agents(10);
        for t in 0..10 {
            m.add(&transition(t))?;
        }
        m.learn(5, 0.99)?;
        for agent in m.agents() {
            assert!(agent.critic.critic.distance(&agent.critic.target_critic)? > 0.0);
        }
        m.update_target(1.0)?;
        for agent in m.agents() {
            assert_eq!(agent.critic.critic.distance(&agent.critic.target_critic)?, 0.0);
            assert_eq!(agent.actor.policy.distance(&agent.actor.target_policy)?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn update_target_zero_is_noop() -> Result<()> {
        let mut m = two_agents(10);
        for t in 0..10 {
            m.add(&transition(t))?;
        }
        m.learn(5, 0.99)?;
        let gaps = m
            .agents()
            .iter()
            .map(|a| a.actor.policy.distance(&a.actor.target_policy))
            .collect::<candle_core::Result<Vec<_>>>()?;
        m.update_target(0.0)?;
        for (agent, gap) in m.agents().iter().zip(gaps) {
            assert_eq!(agent.actor.policy.distance(&agent.actor.target_policy)?, gap);
        }
        assert!(m.update_target(1.5).is_err());
        Ok(())
    }

    #[test]
    fn repeated_soft_updates_close_the_gap() -> Result<()> {
        let mut m = two_agents(10);
        for t in 0..10 {
            m.add(&transition(t))?;
        }
        m.learn(5, 0.99)?;
        let gap = |m: &Maddpg| m.agents()[0].critic.critic.distance(&m.agents()[0].critic.target_critic);
        let g0 = gap(&m)?;
        m.update_target(0.02)?;
        let g1 = gap(&m)?;
        assert!(g1 < g0);

        m.learn(5, 0.99)?;
        let g2 = gap(&m)?;
        m.update_target(0.02)?;
        let g3 = gap(&m)?;
        assert!(g3 < g2);
        Ok(())
    }

    #[test]
    fn select_action_matches_action_spaces() -> Result<()> {
        let mut env = SimpleTag::new(
            SimpleTagParams {
                num_adversaries: 2,
                num_good: 1,
                ..Default::default()
            },
            Some(1),
        );
        let mut m = Maddpg::from_env(
            &env,
            MaddpgParams {
                buffer_capacity: 100,
                hidden_dim: 16,
                seed: Some(1),
                ..Default::default()
            },
        )?;
        m.check_env(&env)?;
        let obs = env.reset();
        for _ in 0..3 {
            let actions = m.select_action(&obs)?;
            assert_eq!(actions.len(), 3);
            for (i, a) in actions.iter().enumerate() {
                assert!(a.unwrap() < env.action_space(i));
            }
            let greedy = m.select_greedy_action(&obs)?;
            assert!(greedy.iter().all(|a| a.unwrap() < 5));
        }
        let mut partial = obs.clone();
        partial[1] = None;
        assert_eq!(m.select_action(&partial)?[1], None);
        Ok(())
    }

    #[test]
    fn check_env_flags_dimension_mismatch() {
        let env = SimpleTag::new(SimpleTagParams::default(), Some(0));
        let m = two_agents(10);
        assert!(matches!(
            m.check_env(&env),
            Err(MaddpgError::UnknownAgent(_)) | Err(MaddpgError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn env_steps_feed_the_buffers() -> Result<()> {
        let mut env = SimpleTag::new(SimpleTagParams::default(), Some(5));
        let mut m = Maddpg::from_env(
            &env,
            MaddpgParams {
                buffer_capacity: 64,
                batch_size: 8,
                hidden_dim: 16,
                seed: Some(5),
                ..Default::default()
            },
        )?;
        let mut obs = env.reset();
        while !env.agents().is_empty() {
            let actions = m.select_action(&obs)?;
            let step = env.step(&actions)?;
            assert!(m.add_env_step(&obs, &actions, &step)?);
            obs = step.next_obs;
        }
        assert_eq!(m.len(), 25);
        let status = m.learn(8, 0.95)?;
        assert!(status.policy_loss.is_finite());
        m.update_target(0.02)?;
        Ok(())
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dims = vec![
            DimInfo {
                obs_dim: 2,
                act_dim: 2,
            };
            2
        ];
        let ids = vec![AgentId::from("a"), AgentId::from("a")];
        assert!(Maddpg::new(ids, dims, MaddpgParams::default()).is_err());
    }
}
