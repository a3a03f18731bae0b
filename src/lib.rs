#![allow(clippy::type_complexity)]

//! Multi-agent DDPG (centralized critics, decentralized actors) trained on a
//! small predator-prey arena.

use std::path::Path;

use tensorboard_rs::summary_writer::SummaryWriter;

pub mod brains;
pub mod envs;
pub mod error;
pub mod hparams;

pub use error::{MaddpgError, Result};

/// Wall-clock label for a training run, used for log directory names.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub struct Timestamp(String);

impl Default for Timestamp {
    fn default() -> Self {
        Self(chrono::Local::now().format("%Y%m%d%H%M%S").to_string())
    }
}

/// Thin TensorBoard sink. An uninitialized writer drops every scalar, which
/// keeps tests and evaluation runs free of event files.
#[derive(Default)]
pub struct TbWriter(Option<SummaryWriter>);

impl TbWriter {
    pub fn init(&mut self, dir: impl AsRef<Path>, timestamp: &Timestamp) {
        let logdir = dir.as_ref().join(format!("tb_{timestamp}"));
        self.0 = Some(SummaryWriter::new(logdir));
    }

    pub fn add_scalar(&mut self, name: &str, scalar: f32, step: usize) {
        if let Some(writer) = self.0.as_mut() {
            writer.add_scalar(name, scalar, step);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.0.as_mut() {
            writer.flush();
        }
    }
}

/// Mean of the trailing `window` entries at every position.
pub fn running_reward(rewards: &[f32], window: usize) -> Vec<f32> {
    let window = window.max(1);
    (0..rewards.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &rewards[start..=i];
            slice.iter().sum::<f32>() / slice.len() as f32
        })
        .collect()
}
