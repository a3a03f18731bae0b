use candle_core::Device;

use crate::TbWriter;

pub mod maddpg;
pub mod utils;

lazy_static::lazy_static! {
    pub static ref DEVICE: Device = Device::Cpu;
}

pub trait Status {
    fn log(&self, writer: &mut TbWriter, step: usize);
}
