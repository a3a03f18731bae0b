use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{MaddpgError, Result};

/// What to store for an agent that has already left the episode while the
/// others keep stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveAgents {
    /// Zero observation, zero action, zero reward, done set.
    #[default]
    ZeroPad,
    /// Drop the whole joint transition so every stored slot has all agents.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaddpgParams {
    pub episode_num: usize,
    pub episode_length: usize,
    pub learn_interval: usize,
    pub random_steps: usize,
    pub tau: f64,
    pub gamma: f64,
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub actor_lr: f64,
    pub critic_lr: f64,
    pub hidden_dim: usize,
    pub grad_clip: f64,
    pub logits_reg: f64,
    pub seed: Option<u64>,
    pub num_adversaries: usize,
    pub num_good: usize,
    pub num_obstacles: usize,
    pub inactive_agents: InactiveAgents,
    pub log_interval: usize,
}

impl Default for MaddpgParams {
    fn default() -> Self {
        Self {
            episode_num: 10_000,
            episode_length: 25,
            learn_interval: 100,
            random_steps: 64,
            tau: 0.02,
            gamma: 0.99,
            buffer_capacity: 1_000_000,
            batch_size: 64,
            actor_lr: 0.01,
            critic_lr: 0.01,
            hidden_dim: 64,
            grad_clip: 0.5,
            logits_reg: 1e-3,
            seed: None,
            num_adversaries: 1,
            num_good: 1,
            num_obstacles: 2,
            inactive_agents: InactiveAgents::ZeroPad,
            log_interval: 100,
        }
    }
}

impl MaddpgParams {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(MaddpgError::InvalidParams(msg));
        if !(0.0..=1.0).contains(&self.tau) {
            return bad(format!("tau must lie in [0, 1], got {}", self.tau));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return bad(format!("gamma must lie in [0, 1], got {}", self.gamma));
        }
        if self.buffer_capacity == 0 {
            return bad("buffer_capacity must be positive".to_owned());
        }
        if self.batch_size == 0 || self.batch_size > self.buffer_capacity {
            return bad(format!(
                "batch_size must lie in [1, buffer_capacity={}], got {}",
                self.buffer_capacity, self.batch_size
            ));
        }
        if self.actor_lr <= 0.0 || self.critic_lr <= 0.0 {
            return bad(format!(
                "learning rates must be positive, got actor {} critic {}",
                self.actor_lr, self.critic_lr
            ));
        }
        if self.hidden_dim == 0 || self.learn_interval == 0 || self.episode_length == 0 {
            return bad("hidden_dim, learn_interval and episode_length must be positive".to_owned());
        }
        if self.log_interval == 0 {
            return bad("log_interval must be positive".to_owned());
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut f = File::create(path)?;
        let s = self.to_yaml()?;
        write!(f, "{}", s)?;
        Ok(())
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let this: Self = serde_yaml::from_str(yaml)?;
        this.validate()?;
        Ok(this)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut f = File::open(path)?;
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        Self::from_yaml(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MaddpgParams::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let params = MaddpgParams::from_yaml("tau: 0.5\ninactive_agents: skip\n").unwrap();
        assert_eq!(params.tau, 0.5);
        assert_eq!(params.inactive_agents, InactiveAgents::Skip);
        assert_eq!(params.batch_size, 64);
    }

    #[test]
    fn rejects_out_of_range_tau() {
        let params = MaddpgParams {
            tau: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(MaddpgError::InvalidParams(_))
        ));
    }

    #[test]
    fn rejects_batch_larger_than_capacity() {
        let params = MaddpgParams {
            buffer_capacity: 8,
            batch_size: 16,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        let params = MaddpgParams {
            seed: Some(7),
            ..Default::default()
        };
        params.to_yaml_file(&path).unwrap();
        assert_eq!(MaddpgParams::from_yaml_file(&path).unwrap(), params);
    }
}
