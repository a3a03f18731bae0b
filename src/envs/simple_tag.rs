use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{hparams::MaddpgParams, MaddpgError, Result};

use super::{AgentId, AgentMap, Env, StepResult};

pub const ACTION_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimpleTagParams {
    pub num_adversaries: usize,
    pub num_good: usize,
    pub num_obstacles: usize,
    pub max_cycles: usize,
    pub dt: f32,
    pub damping: f32,
    pub adversary_size: f32,
    pub adversary_accel: f32,
    pub adversary_max_speed: f32,
    pub good_size: f32,
    pub good_accel: f32,
    pub good_max_speed: f32,
    pub obstacle_size: f32,
    pub collision_reward: f32,
}

impl Default for SimpleTagParams {
    fn default() -> Self {
        Self {
            num_adversaries: 1,
            num_good: 1,
            num_obstacles: 2,
            max_cycles: 25,
            dt: 0.1,
            damping: 0.25,
            adversary_size: 0.075,
            adversary_accel: 3.0,
            adversary_max_speed: 1.0,
            good_size: 0.05,
            good_accel: 4.0,
            good_max_speed: 1.3,
            obstacle_size: 0.2,
            collision_reward: 10.0,
        }
    }
}

impl From<&MaddpgParams> for SimpleTagParams {
    fn from(p: &MaddpgParams) -> Self {
        Self {
            num_adversaries: p.num_adversaries,
            num_good: p.num_good,
            num_obstacles: p.num_obstacles,
            max_cycles: p.episode_length,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Body {
    pos: Vector2<f32>,
    vel: Vector2<f32>,
    size: f32,
    accel: f32,
    max_speed: f32,
    adversary: bool,
}

impl Body {
    fn collides(&self, other: &Body) -> bool {
        (self.pos - other.pos).norm() < self.size + other.size
    }
}

/// Penalty for good agents that wander off the unit square.
fn bound(x: f32) -> f32 {
    if x < 0.9 {
        0.0
    } else if x < 1.0 {
        (x - 0.9) * 10.0
    } else {
        (2.0 * x - 2.0).exp().min(10.0)
    }
}

/// Movement force for a discrete action: no-op, left, right, down, up.
fn action_force(action: usize) -> Vector2<f32> {
    match action {
        1 => Vector2::new(-1.0, 0.0),
        2 => Vector2::new(1.0, 0.0),
        3 => Vector2::new(0.0, -1.0),
        4 => Vector2::new(0.0, 1.0),
        _ => Vector2::zeros(),
    }
}

/// Predators (`adversary_*`) chase prey (`agent_*`) around static obstacles.
pub struct SimpleTag {
    pub params: SimpleTagParams,
    ids: Vec<AgentId>,
    bodies: Vec<Body>,
    obstacles: Vec<Vector2<f32>>,
    active: Vec<bool>,
    cycle: usize,
    rng: ChaCha8Rng,
}

impl SimpleTag {
    pub fn new(params: SimpleTagParams, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let ids = (0..params.num_adversaries)
            .map(|i| AgentId(format!("adversary_{i}")))
            .chain((0..params.num_good).map(|i| AgentId(format!("agent_{i}"))))
            .collect::<Vec<_>>();
        let bodies = (0..ids.len())
            .map(|i| {
                let adversary = i < params.num_adversaries;
                Body {
                    size: if adversary {
                        params.adversary_size
                    } else {
                        params.good_size
                    },
                    accel: if adversary {
                        params.adversary_accel
                    } else {
                        params.good_accel
                    },
                    max_speed: if adversary {
                        params.adversary_max_speed
                    } else {
                        params.good_max_speed
                    },
                    adversary,
                    ..Default::default()
                }
            })
            .collect();
        let mut this = Self {
            params,
            active: vec![false; ids.len()],
            ids,
            bodies,
            obstacles: vec![Vector2::zeros(); params.num_obstacles],
            cycle: 0,
            rng,
        };
        this.scatter();
        this
    }

    fn scatter(&mut self) {
        for body in self.bodies.iter_mut() {
            body.pos = Vector2::new(self.rng.gen_range(-1.0..1.0), self.rng.gen_range(-1.0..1.0));
            body.vel = Vector2::zeros();
        }
        for obstacle in self.obstacles.iter_mut() {
            *obstacle = Vector2::new(self.rng.gen_range(-0.9..0.9), self.rng.gen_range(-0.9..0.9));
        }
    }

    fn observe(&self, i: usize) -> Box<[f32]> {
        let me = &self.bodies[i];
        let mut out = Vec::with_capacity(self.observation_space(i));
        out.extend_from_slice(me.vel.as_slice());
        out.extend_from_slice(me.pos.as_slice());
        for obstacle in &self.obstacles {
            out.extend_from_slice((obstacle - me.pos).as_slice());
        }
        for (j, other) in self.bodies.iter().enumerate() {
            if j != i {
                out.extend_from_slice((other.pos - me.pos).as_slice());
            }
        }
        for (j, other) in self.bodies.iter().enumerate() {
            if j != i && !other.adversary {
                out.extend_from_slice(other.vel.as_slice());
            }
        }
        out.into_boxed_slice()
    }

    fn reward(&self, i: usize) -> f32 {
        let me = &self.bodies[i];
        let adversaries = self.bodies.iter().filter(|b| b.adversary);
        if me.adversary {
            let mut rew = 0.0;
            for good in self.bodies.iter().filter(|b| !b.adversary) {
                for adv in adversaries.clone() {
                    if good.collides(adv) {
                        rew += self.params.collision_reward;
                    }
                }
            }
            rew
        } else {
            let mut rew = 0.0;
            for adv in adversaries {
                if me.collides(adv) {
                    rew -= self.params.collision_reward;
                }
            }
            rew - bound(me.pos.x.abs()) - bound(me.pos.y.abs())
        }
    }
}

impl Env for SimpleTag {
    fn possible_agents(&self) -> &[AgentId] {
        &self.ids
    }

    fn agents(&self) -> Vec<usize> {
        (0..self.ids.len()).filter(|i| self.active[*i]).collect()
    }

    fn observation_space(&self, agent: usize) -> usize {
        let n = self.ids.len();
        let other_good = if self.bodies[agent].adversary {
            self.params.num_good
        } else {
            self.params.num_good - 1
        };
        4 + 2 * self.params.num_obstacles + 2 * (n - 1) + 2 * other_good
    }

    fn action_space(&self, _agent: usize) -> usize {
        ACTION_LEN
    }

    fn reset(&mut self) -> AgentMap<Box<[f32]>> {
        self.scatter();
        self.cycle = 0;
        self.active.iter_mut().for_each(|a| *a = true);
        (0..self.ids.len()).map(|i| Some(self.observe(i))).collect()
    }

    fn step(&mut self, actions: &[Option<usize>]) -> Result<StepResult> {
        if actions.len() != self.ids.len() {
            return Err(MaddpgError::dims("joint action", self.ids.len(), actions.len()));
        }
        if let Some(a) = actions.iter().flatten().find(|a| **a >= ACTION_LEN) {
            return Err(MaddpgError::dims("action index", ACTION_LEN, *a));
        }
        let n = self.ids.len();
        let dt = self.params.dt;
        for (i, body) in self.bodies.iter_mut().enumerate() {
            let force = match actions[i] {
                Some(a) if self.active[i] => action_force(a) * body.accel,
                _ => Vector2::zeros(),
            };
            body.vel = body.vel * (1.0 - self.params.damping) + force * dt;
            let speed = body.vel.norm();
            if speed > body.max_speed {
                body.vel *= body.max_speed / speed;
            }
            body.pos += body.vel * dt;
        }
        self.cycle += 1;
        let truncated = self.cycle >= self.params.max_cycles;

        let mut out = StepResult {
            next_obs: vec![None; n],
            rewards: vec![None; n],
            terminations: vec![None; n],
            truncations: vec![None; n],
            info: vec![("cycle".to_owned(), self.cycle.to_string())],
        };
        for i in 0..n {
            if !self.active[i] {
                continue;
            }
            out.next_obs[i] = Some(self.observe(i));
            out.rewards[i] = Some(self.reward(i));
            out.terminations[i] = Some(false);
            out.truncations[i] = Some(truncated);
        }
        if truncated {
            self.active.iter_mut().for_each(|a| *a = false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> SimpleTag {
        SimpleTag::new(
            SimpleTagParams {
                num_adversaries: 2,
                num_good: 1,
                num_obstacles: 2,
                max_cycles: 3,
                ..Default::default()
            },
            Some(0),
        )
    }

    #[test]
    fn observation_lengths_match_spaces() {
        let mut env = env();
        let obs = env.reset();
        assert_eq!(env.possible_agents()[0].0, "adversary_0");
        assert_eq!(env.possible_agents()[2].0, "agent_0");
        for (i, o) in obs.iter().enumerate() {
            assert_eq!(o.as_ref().unwrap().len(), env.observation_space(i));
        }
        // adversary sees 2 obstacles, 2 others, 1 good velocity
        assert_eq!(env.observation_space(0), 4 + 4 + 4 + 2);
        assert_eq!(env.observation_space(2), 4 + 4 + 4);
    }

    #[test]
    fn episode_truncates_after_max_cycles() {
        let mut env = env();
        env.reset();
        let mut steps = 0;
        while !env.agents().is_empty() {
            let step = env.step(&[Some(1), Some(2), Some(0)]).unwrap();
            steps += 1;
            assert!(step.rewards.iter().all(Option::is_some));
            if steps == 3 {
                assert!(step.truncations.iter().all(|t| *t == Some(true)));
            }
        }
        assert_eq!(steps, 3);
    }

    #[test]
    fn adversary_on_top_of_prey_collects_reward() {
        let mut env = env();
        env.reset();
        env.bodies[0].pos = Vector2::new(0.0, 0.0);
        env.bodies[1].pos = Vector2::new(0.5, 0.5);
        env.bodies[2].pos = Vector2::new(0.01, 0.0);
        assert_eq!(env.reward(0), 10.0);
        assert_eq!(env.reward(1), 10.0);
        assert_eq!(env.reward(2), -10.0);
    }

    #[test]
    fn rejects_out_of_range_action() {
        let mut env = env();
        env.reset();
        assert!(env.step(&[Some(9), Some(0), Some(0)]).is_err());
    }

    #[test]
    fn seeded_envs_agree() {
        let (mut a, mut b) = (env(), env());
        assert_eq!(a.reset(), b.reset());
    }
}
