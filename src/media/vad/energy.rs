use super::VadEngine;
use crate::AudioFrame;
use anyhow::Result;

pub struct EnergyVad {
    threshold_db: f32,
}

impl EnergyVad {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }
}

impl VadEngine for EnergyVad {
    fn process(&mut self, _frame: &AudioFrame, energy_db: f32) -> Result<bool> {
        Ok(energy_db >= self.threshold_db)
    }
}
