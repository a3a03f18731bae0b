use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use kdam::{tqdm, BarExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use wiglrs_maddpg::{
    brains::learners::{
        maddpg::{checkpoint::Checkpoint, Maddpg},
        Status,
    },
    envs::{simple_tag::SimpleTag, Env},
    hparams::MaddpgParams,
    running_reward, TbWriter, Timestamp,
};

const ENV_NAME: &str = "simple_tag";
const RUNNING_WINDOW: usize = 100;

/// Train MADDPG on the predator-prey arena.
#[derive(Parser)]
#[command(name = "wiglrs-maddpg", version, about, long_about = None)]
struct Cli {
    /// YAML file with training parameters; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the numbered run directories
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Load the run saved in this directory and evaluate it instead of training
    #[arg(long)]
    evaluate: Option<PathBuf>,

    /// Episodes to run in evaluation mode
    #[arg(long, default_value = "10")]
    eval_episodes: usize,

    /// Total episode num during training
    #[arg(long)]
    episode_num: Option<usize>,

    /// Steps per episode
    #[arg(long)]
    episode_length: Option<usize>,

    /// Steps between learning updates
    #[arg(long)]
    learn_interval: Option<usize>,

    /// Random steps before the agents start to learn
    #[arg(long)]
    random_steps: Option<usize>,

    /// Soft update parameter
    #[arg(long)]
    tau: Option<f64>,

    /// Discount factor
    #[arg(long)]
    gamma: Option<f64>,

    /// Capacity of each replay buffer
    #[arg(long)]
    buffer_capacity: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    actor_lr: Option<f64>,

    #[arg(long)]
    critic_lr: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn params(&self) -> Result<MaddpgParams> {
        let mut p = match &self.config {
            Some(path) => MaddpgParams::from_yaml_file(path)
                .with_context(|| format!("reading parameters from {path:?}"))?,
            None => MaddpgParams::default(),
        };
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field {
                    p.$field = v;
                })*
            };
        }
        apply!(
            episode_num,
            episode_length,
            learn_interval,
            random_steps,
            tau,
            gamma,
            buffer_capacity,
            batch_size,
            actor_lr,
            critic_lr
        );
        if self.seed.is_some() {
            p.seed = self.seed;
        }
        p.validate()?;
        Ok(p)
    }
}

/// `root/simple_tag/{n + 1}` where `n` counts the runs already there.
fn next_run_dir(root: &Path) -> Result<PathBuf> {
    let env_dir = root.join(ENV_NAME);
    std::fs::create_dir_all(&env_dir)?;
    let total = std::fs::read_dir(&env_dir)?.count();
    let dir = env_dir.join(format!("{}", total + 1));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn env_rng(params: &MaddpgParams) -> ChaCha8Rng {
    match params.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn train(params: MaddpgParams, results_dir: &Path) -> Result<()> {
    let run_dir = next_run_dir(results_dir)?;
    params.to_yaml_file(run_dir.join(Checkpoint::PARAMS))?;
    let timestamp = Timestamp::default();
    let mut writer = TbWriter::default();
    writer.init(&run_dir, &timestamp);
    tracing::info!("training run {timestamp} in {run_dir:?}");

    let mut env = SimpleTag::new((&params).into(), params.seed);
    let mut maddpg = Maddpg::from_env(&env, params.clone())?;
    let mut rng = env_rng(&params);
    let ids = env.possible_agents().to_vec();
    let n = env.num_agents();

    let mut step = 0usize;
    let mut episode_rewards = vec![vec![0.0f32; params.episode_num]; n];
    let mut it = tqdm!(total = params.episode_num, desc = "Training");
    for episode in 0..params.episode_num {
        let mut obs = env.reset();
        let mut agent_reward = vec![0.0f32; n];
        while !env.agents().is_empty() {
            step += 1;
            let actions = if step < params.random_steps {
                obs.iter()
                    .enumerate()
                    .map(|(i, o)| o.as_ref().map(|_| env.sample_action(i, &mut rng)))
                    .collect()
            } else {
                maddpg.select_action(&obs)?
            };

            let result = env.step(&actions)?;
            maddpg.add_env_step(&obs, &actions, &result)?;
            for (acc, r) in agent_reward.iter_mut().zip(result.rewards.iter()) {
                *acc += r.unwrap_or(0.0);
            }

            if step >= params.random_steps && step % params.learn_interval == 0 {
                if maddpg.len() >= params.batch_size {
                    let status = maddpg.learn(params.batch_size, params.gamma)?;
                    status.log(&mut writer, step);
                    maddpg.update_target(params.tau)?;
                } else {
                    tracing::debug!(
                        "skipping learn at step {step}: {} of {} transitions",
                        maddpg.len(),
                        params.batch_size
                    );
                }
            }
            obs = result.next_obs;
        }

        for (i, r) in agent_reward.iter().enumerate() {
            episode_rewards[i][episode] = *r;
            writer.add_scalar(&format!("Reward/{}", ids[i]), *r, episode);
        }

        if (episode + 1) % params.log_interval == 0 {
            let mut message = format!("episode {}, ", episode + 1);
            let mut sum_reward = 0.0;
            for (id, r) in ids.iter().zip(agent_reward.iter()) {
                message.push_str(&format!("{id}: {r:>4}; "));
                if id.0 == "adversary_0" || id.0 == "agent_0" {
                    sum_reward += r;
                }
            }
            message.push_str(&format!("sum reward: {sum_reward}"));
            tracing::info!("{message}");
            let status = maddpg.status;
            it.set_postfix(format!(
                "pl={:.4} vl={:.4}",
                status.policy_loss, status.value_loss
            ));
        }
        it.update(1).ok();
    }

    maddpg.save(&run_dir, &episode_rewards)?;
    for (id, rewards) in ids.iter().zip(episode_rewards.iter()) {
        for (episode, r) in running_reward(rewards, RUNNING_WINDOW).into_iter().enumerate() {
            writer.add_scalar(&format!("RunningReward/{id}"), r, episode);
        }
    }
    writer.flush();
    tracing::info!("saved run to {run_dir:?}");
    Ok(())
}

fn evaluate(dir: &Path, episodes: usize) -> Result<()> {
    let ckpt = Checkpoint::new(dir);
    let params = ckpt
        .load_params()
        .with_context(|| format!("reading parameters of {dir:?}"))?;
    let mut env = SimpleTag::new((&params).into(), params.seed);
    let maddpg = Maddpg::load(
        env.possible_agents().to_vec(),
        env.dim_info(),
        params,
        dir,
    )?;
    let n = env.num_agents();
    let mut totals = vec![0.0f32; n];
    for _ in 0..episodes {
        let mut obs = env.reset();
        while !env.agents().is_empty() {
            let actions = maddpg.select_greedy_action(&obs)?;
            let result = env.step(&actions)?;
            for (acc, r) in totals.iter_mut().zip(result.rewards.iter()) {
                *acc += r.unwrap_or(0.0);
            }
            obs = result.next_obs;
        }
    }
    for (id, total) in env.possible_agents().iter().zip(totals) {
        tracing::info!("{id}: mean reward {:.3}", total / episodes.max(1) as f32);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    match &cli.evaluate {
        Some(dir) => evaluate(dir, cli.eval_episodes),
        None => train(cli.params()?, &cli.results_dir),
    }
}
