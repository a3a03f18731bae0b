use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{hparams::InactiveAgents, MaddpgError, Result};

pub mod simple_tag;

/// Stable agent name, e.g. `adversary_0`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub struct AgentId(pub String);

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimInfo {
    pub obs_dim: usize,
    pub act_dim: usize,
}

/// One entry per configured agent slot; `None` once that agent has left the
/// episode.
pub type AgentMap<T> = Vec<Option<T>>;

#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub next_obs: AgentMap<Box<[f32]>>,
    pub rewards: AgentMap<f32>,
    pub terminations: AgentMap<bool>,
    pub truncations: AgentMap<bool>,
    pub info: Vec<(String, String)>,
}

/// Parallel multi-agent environment with a fixed set of possible agents.
pub trait Env {
    fn possible_agents(&self) -> &[AgentId];

    /// Slots of the agents still taking part in the current episode.
    fn agents(&self) -> Vec<usize>;

    fn observation_space(&self, agent: usize) -> usize;

    /// Number of discrete actions.
    fn action_space(&self, agent: usize) -> usize;

    fn reset(&mut self) -> AgentMap<Box<[f32]>>;

    fn step(&mut self, actions: &[Option<usize>]) -> Result<StepResult>;

    fn num_agents(&self) -> usize {
        self.possible_agents().len()
    }

    fn dim_info(&self) -> Vec<DimInfo> {
        (0..self.num_agents())
            .map(|i| DimInfo {
                obs_dim: self.observation_space(i),
                act_dim: self.action_space(i),
            })
            .collect()
    }

    fn sample_action<R: Rng + ?Sized>(&self, agent: usize, rng: &mut R) -> usize {
        rng.gen_range(0..self.action_space(agent))
    }
}

/// A timestep for every configured agent, ready for the replay buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct JointTransition {
    pub obs: Vec<Box<[f32]>>,
    pub actions: Vec<usize>,
    pub rewards: Vec<f32>,
    pub next_obs: Vec<Box<[f32]>>,
    pub dones: Vec<bool>,
}

impl JointTransition {
    /// Assembles the joint transition for one env step. Agents missing from
    /// `obs`, `actions` or the step result are handled per `inactive`;
    /// returns `None` when the step has to be dropped.
    pub fn collect(
        dims: &[DimInfo],
        obs: &AgentMap<Box<[f32]>>,
        actions: &[Option<usize>],
        step: &StepResult,
        inactive: InactiveAgents,
    ) -> Result<Option<Self>> {
        let n = dims.len();
        for (what, len) in [
            ("observations", obs.len()),
            ("actions", actions.len()),
            ("next observations", step.next_obs.len()),
            ("rewards", step.rewards.len()),
            ("terminations", step.terminations.len()),
        ] {
            if len != n {
                return Err(MaddpgError::dims(what, n, len));
            }
        }

        let mut out = Self {
            obs: Vec::with_capacity(n),
            actions: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            next_obs: Vec::with_capacity(n),
            dones: Vec::with_capacity(n),
        };
        for (i, dim) in dims.iter().enumerate() {
            match (&obs[i], actions[i], &step.next_obs[i], step.rewards[i]) {
                (Some(o), Some(a), Some(no), Some(r)) => {
                    out.obs.push(o.clone());
                    out.actions.push(a);
                    out.rewards.push(r);
                    out.next_obs.push(no.clone());
                    out.dones.push(step.terminations[i].unwrap_or(false));
                }
                _ => match inactive {
                    InactiveAgents::Skip => return Ok(None),
                    InactiveAgents::ZeroPad => {
                        let zeros = vec![0.0f32; dim.obs_dim].into_boxed_slice();
                        out.obs.push(obs[i].clone().unwrap_or_else(|| zeros.clone()));
                        out.actions.push(actions[i].unwrap_or(0));
                        out.rewards.push(step.rewards[i].unwrap_or(0.0));
                        out.next_obs.push(step.next_obs[i].clone().unwrap_or(zeros));
                        out.dones.push(true);
                    }
                },
            }
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<DimInfo> {
        vec![
            DimInfo {
                obs_dim: 2,
                act_dim: 3,
            };
            2
        ]
    }

    fn half_done_step() -> (AgentMap<Box<[f32]>>, Vec<Option<usize>>, StepResult) {
        let obs = vec![
            Some(vec![1.0, 2.0].into_boxed_slice()),
            Some(vec![3.0, 4.0].into_boxed_slice()),
        ];
        let actions = vec![Some(2), None];
        let step = StepResult {
            next_obs: vec![Some(vec![5.0, 6.0].into_boxed_slice()), None],
            rewards: vec![Some(1.5), None],
            terminations: vec![Some(false), None],
            truncations: vec![Some(false), None],
            info: vec![],
        };
        (obs, actions, step)
    }

    #[test]
    fn zero_pad_fills_missing_agent() {
        let (obs, actions, step) = half_done_step();
        let t = JointTransition::collect(&dims(), &obs, &actions, &step, InactiveAgents::ZeroPad)
            .unwrap()
            .unwrap();
        assert_eq!(t.actions, vec![2, 0]);
        assert_eq!(t.rewards, vec![1.5, 0.0]);
        assert_eq!(&*t.obs[1], &[3.0, 4.0]);
        assert_eq!(&*t.next_obs[1], &[0.0, 0.0]);
        assert_eq!(t.dones, vec![false, true]);
    }

    #[test]
    fn skip_drops_partial_step() {
        let (obs, actions, step) = half_done_step();
        let t = JointTransition::collect(&dims(), &obs, &actions, &step, InactiveAgents::Skip)
            .unwrap();
        assert!(t.is_none());
    }

    #[test]
    fn wrong_agent_count_is_an_error() {
        let (obs, _, step) = half_done_step();
        let err =
            JointTransition::collect(&dims(), &obs, &[Some(0)], &step, InactiveAgents::ZeroPad)
                .unwrap_err();
        assert!(matches!(err, MaddpgError::DimensionMismatch { .. }));
    }
}
