use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use candle_core::Tensor;

use crate::{
    brains::{learners::DEVICE, models::CopyWeights},
    envs::{AgentId, DimInfo},
    hparams::MaddpgParams,
    MaddpgError, Result,
};

use super::Maddpg;

/// File layout of a saved run directory.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub dir: PathBuf,
}

impl Checkpoint {
    pub const MODEL: &'static str = "model.safetensors";
    pub const REWARDS: &'static str = "rewards.json";
    pub const PARAMS: &'static str = "params.yaml";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(Self::MODEL)
    }

    pub fn rewards_path(&self) -> PathBuf {
        self.dir.join(Self::REWARDS)
    }

    pub fn params_path(&self) -> PathBuf {
        self.dir.join(Self::PARAMS)
    }

    /// Per-agent episode rewards, keyed by agent id.
    pub fn load_rewards(&self) -> Result<BTreeMap<AgentId, Vec<f32>>> {
        let f = File::open(self.rewards_path())?;
        Ok(serde_json::from_reader(BufReader::new(f))?)
    }

    pub fn load_params(&self) -> Result<MaddpgParams> {
        MaddpgParams::from_yaml_file(self.params_path())
    }

    fn error(&self, reason: impl Into<String>) -> MaddpgError {
        MaddpgError::Checkpoint {
            path: self.model_path(),
            reason: reason.into(),
        }
    }
}

fn load_net(
    ckpt: &Checkpoint,
    tensors: &mut HashMap<String, Tensor>,
    prefix: &str,
    net: &impl CopyWeights,
) -> Result<()> {
    let mut missing = None;
    let loaded = net.load_named(|var| {
        let key = format!("{prefix}.{var}");
        let t = tensors.remove(&key);
        if t.is_none() {
            missing = Some(key);
        }
        t
    });
    match (loaded, missing) {
        (_, Some(key)) => Err(ckpt.error(format!("missing tensor {key}"))),
        (Err(e), None) => Err(ckpt.error(e.to_string())),
        (Ok(()), None) => Ok(()),
    }
}

impl Maddpg {
    /// Writes the live actor and critic parameters of every agent, the
    /// parameters this learner was built with and `rewards[i]` for agent `i`.
    pub fn save(&self, dir: impl AsRef<Path>, rewards: &[Vec<f32>]) -> Result<Checkpoint> {
        if rewards.len() != self.num_agents() {
            return Err(MaddpgError::dims(
                "reward histories",
                self.num_agents(),
                rewards.len(),
            ));
        }
        let ckpt = Checkpoint::new(dir);
        std::fs::create_dir_all(&ckpt.dir)?;

        let mut tensors = HashMap::new();
        for agent in self.agents() {
            for (name, t) in agent.actor.policy.named_tensors()? {
                tensors.insert(format!("{}.actor.{name}", agent.id), t);
            }
            for (name, t) in agent.critic.critic.named_tensors()? {
                tensors.insert(format!("{}.critic.{name}", agent.id), t);
            }
        }
        candle_core::safetensors::save(&tensors, ckpt.model_path())?;

        let history = self
            .ids()
            .cloned()
            .zip(rewards.iter().cloned())
            .collect::<BTreeMap<_, _>>();
        let f = File::create(ckpt.rewards_path())?;
        serde_json::to_writer(BufWriter::new(f), &history)?;

        self.params.to_yaml_file(ckpt.params_path())?;
        tracing::info!("saved {} tensors to {:?}", tensors.len(), ckpt.dir);
        Ok(ckpt)
    }

    /// Rebuilds a learner from `save` output. Targets start as exact copies of
    /// the loaded live networks.
    pub fn load(
        ids: Vec<AgentId>,
        dims: Vec<DimInfo>,
        params: MaddpgParams,
        dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let ckpt = Checkpoint::new(dir);
        let path = ckpt.model_path();
        if !path.exists() {
            return Err(ckpt.error("no model file"));
        }
        let mut tensors = candle_core::safetensors::load(&path, &DEVICE)?;
        let maddpg = Self::new(ids, dims, params)?;

        for agent in maddpg.agents() {
            load_net(&ckpt, &mut tensors, &format!("{}.actor", agent.id), &agent.actor.policy)?;
            load_net(&ckpt, &mut tensors, &format!("{}.critic", agent.id), &agent.critic.critic)?;
            agent.sync_targets()?;
        }
        if let Some(extra) = tensors.keys().next() {
            return Err(ckpt.error(format!("unexpected tensor {extra}")));
        }
        tracing::info!("loaded {} agents from {:?}", maddpg.num_agents(), ckpt.dir);
        Ok(maddpg)
    }
}
