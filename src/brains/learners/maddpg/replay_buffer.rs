use candle_core::Tensor;
use rand::Rng;

use crate::{
    brains::learners::{utils::batch_tensor, DEVICE},
    MaddpgError, Result,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub obs: Box<[f32]>,
    pub action: Box<[f32]>,
    pub reward: f32,
    pub next_obs: Box<[f32]>,
    pub done: bool,
}

/// Column tensors for a sampled index set, `[batch, dim]` or `[batch]`.
#[derive(Debug, Clone)]
pub struct Sample {
    pub obs: Tensor,
    pub action: Tensor,
    pub reward: Tensor,
    pub next_obs: Tensor,
    pub done: Tensor,
}

/// Fixed-capacity ring of one agent's transitions, stored column-wise.
/// Storage grows on demand up to `capacity`, after which the oldest slot is
/// overwritten.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    capacity: usize,
    obs_dim: usize,
    act_dim: usize,
    write_head: usize,
    len: usize,
    obs: Vec<f32>,
    action: Vec<f32>,
    reward: Vec<f32>,
    next_obs: Vec<f32>,
    done: Vec<f32>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, obs_dim: usize, act_dim: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MaddpgError::InvalidParams(
                "replay buffer capacity must be positive".to_owned(),
            ));
        }
        Ok(Self {
            capacity,
            obs_dim,
            act_dim,
            write_head: 0,
            len: 0,
            obs: Vec::new(),
            action: Vec::new(),
            reward: Vec::new(),
            next_obs: Vec::new(),
            done: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slot the next `add` writes to.
    pub fn write_head(&self) -> usize {
        self.write_head
    }

    pub fn check(&self, obs: &[f32], action: &[f32], next_obs: &[f32]) -> Result<()> {
        if obs.len() != self.obs_dim {
            return Err(MaddpgError::dims("observation", self.obs_dim, obs.len()));
        }
        if next_obs.len() != self.obs_dim {
            return Err(MaddpgError::dims("next observation", self.obs_dim, next_obs.len()));
        }
        if action.len() != self.act_dim {
            return Err(MaddpgError::dims("action", self.act_dim, action.len()));
        }
        Ok(())
    }

    pub fn add(
        &mut self,
        obs: &[f32],
        action: &[f32],
        reward: f32,
        next_obs: &[f32],
        done: bool,
    ) -> Result<()> {
        self.check(obs, action, next_obs)?;
        let done = if done { 1.0 } else { 0.0 };
        if self.len < self.capacity {
            self.obs.extend_from_slice(obs);
            self.action.extend_from_slice(action);
            self.reward.push(reward);
            self.next_obs.extend_from_slice(next_obs);
            self.done.push(done);
            self.len += 1;
        } else {
            let i = self.write_head;
            let (o, a) = (self.obs_dim, self.act_dim);
            self.obs[i * o..(i + 1) * o].copy_from_slice(obs);
            self.action[i * a..(i + 1) * a].copy_from_slice(action);
            self.reward[i] = reward;
            self.next_obs[i * o..(i + 1) * o].copy_from_slice(next_obs);
            self.done[i] = done;
        }
        self.write_head = (self.write_head + 1) % self.capacity;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<Transition> {
        if index >= self.len {
            return None;
        }
        let (o, a) = (self.obs_dim, self.act_dim);
        Some(Transition {
            obs: self.obs[index * o..(index + 1) * o].into(),
            action: self.action[index * a..(index + 1) * a].into(),
            reward: self.reward[index],
            next_obs: self.next_obs[index * o..(index + 1) * o].into(),
            done: self.done[index] > 0.5,
        })
    }

    pub fn sample(&self, indices: &[usize]) -> Result<Sample> {
        if let Some(&index) = indices.iter().find(|i| **i >= self.len) {
            return Err(MaddpgError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        let (o, a) = (self.obs_dim, self.act_dim);
        let gather = |src: &[f32], width: usize| {
            let mut out = Vec::with_capacity(indices.len() * width);
            for i in indices {
                out.extend_from_slice(&src[i * width..(i + 1) * width]);
            }
            out
        };
        Ok(Sample {
            obs: batch_tensor(gather(&self.obs, o), o)?,
            action: batch_tensor(gather(&self.action, a), a)?,
            reward: Tensor::new(gather(&self.reward, 1).as_slice(), &DEVICE)?,
            next_obs: batch_tensor(gather(&self.next_obs, o), o)?,
            done: Tensor::new(gather(&self.done, 1).as_slice(), &DEVICE)?,
        })
    }
}

/// `batch_size` distinct indices drawn uniformly from `[0, len)`.
pub fn sample_indices<R: Rng + ?Sized>(
    rng: &mut R,
    len: usize,
    batch_size: usize,
) -> Result<Vec<usize>> {
    if batch_size == 0 || batch_size > len {
        return Err(MaddpgError::BufferUnderflow { len, batch_size });
    }
    Ok(rand::seq::index::sample(rng, len, batch_size).into_vec())
}
