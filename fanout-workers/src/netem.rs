//! Network condition simulator.
//!
//! Holds every worker's [`NetworkLink`] by name so scenarios can change a
//! worker's profile without holding the worker. Profiles are replaced
//! atomically (last writer wins) and are never healed by the simulator
//! itself; only [`NetworkSimulator::clear_conditions`] or a stopped chaos
//! schedule resets them.
//!
//! A chaos schedule re-rolls a random profile for every registered worker
//! on a fixed interval, sampled from a [`ChaosLevel`] preset.

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use fanout_client::{LinkStats, NetworkLink};
use fanout_types::{ChaosLevel, ChaosPreset, NetworkConditions};

use crate::error::{Result, WorkerError};

const MIN_CHAOS_INTERVAL: Duration = Duration::from_millis(1);

/// Named network links. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct NetworkSimulator {
    links: Arc<DashMap<String, NetworkLink>>,
}

impl NetworkSimulator {
    /// Empty simulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `link` under its label.
    pub fn register(&self, link: NetworkLink) {
        self.links.insert(link.label().to_string(), link);
    }

    /// Stop tracking `name`.
    pub fn unregister(&self, name: &str) -> Option<NetworkLink> {
        self.links.remove(name).map(|(_, link)| link)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn link(&self, name: &str) -> Result<NetworkLink> {
        self.links
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WorkerError::WorkerNotFound(name.to_string()))
    }

    /// Replace `name`'s profile. Invalid profiles are rejected unchanged.
    pub fn set_conditions(&self, name: &str, conditions: NetworkConditions) -> Result<()> {
        conditions.validate()?;
        let link = self.link(name)?;
        tracing::info!(worker = name, %conditions, "network conditions applied");
        link.set_conditions(conditions);
        Ok(())
    }

    /// Reset `name` to no faults.
    pub fn clear_conditions(&self, name: &str) -> Result<()> {
        self.link(name)?.clear_conditions();
        tracing::info!(worker = name, "network conditions cleared");
        Ok(())
    }

    /// Reset every link.
    pub fn clear_all(&self) {
        for entry in self.links.iter() {
            entry.value().clear_conditions();
        }
    }

    /// Current profile of `name`.
    pub fn conditions(&self, name: &str) -> Option<NetworkConditions> {
        self.links.get(name).map(|entry| entry.value().conditions())
    }

    /// Counters of `name`'s link.
    pub fn stats(&self, name: &str) -> Option<LinkStats> {
        self.links.get(name).map(|entry| entry.value().stats())
    }

    /// Every profile that is not "none", by name.
    pub fn active_profiles(&self) -> BTreeMap<String, NetworkConditions> {
        self.links
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().conditions()))
            .filter(|(_, conditions)| !conditions.is_unaffected())
            .collect()
    }

    /// Roll a fresh profile for every link now.
    pub fn reroll(&self, preset: &ChaosPreset, rng: &mut StdRng) {
        for name in self.names() {
            let conditions = sample(preset, rng);
            if let Some(entry) = self.links.get(&name) {
                entry.value().set_conditions(conditions);
            }
        }
    }

    /// Re-roll every profile from `level` each `interval` (the level's own
    /// interval when `None`) until the handle is stopped or dropped.
    pub fn start_chaos(
        &self,
        level: ChaosLevel,
        interval: Option<Duration>,
        seed: Option<u64>,
    ) -> ChaosHandle {
        let preset = level.preset();
        let interval = interval
            .unwrap_or(Duration::from_millis(preset.interval_ms))
            .max(MIN_CHAOS_INTERVAL);
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let simulator = self.clone();

        tracing::info!(
            level = level.as_str(),
            interval_ms = interval.as_millis() as u64,
            workers = self.len(),
            "chaos started"
        );
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                simulator.reroll(&preset, &mut rng);
                tracing::debug!(level = level.as_str(), "chaos profiles re-rolled");
            }
        });

        ChaosHandle {
            level,
            task: Some(task),
            simulator: self.clone(),
        }
    }
}

fn sample(preset: &ChaosPreset, rng: &mut StdRng) -> NetworkConditions {
    let delay = rng.gen_range(preset.delay_ms.0..=preset.delay_ms.1);
    let jitter = rng.gen_range(preset.jitter_ms.0..=preset.jitter_ms.1);
    let loss = rng.gen_range(preset.loss_percent.0..=preset.loss_percent.1);
    preset.conditions(delay, jitter, loss)
}

/// A running chaos schedule.
#[derive(Debug)]
pub struct ChaosHandle {
    level: ChaosLevel,
    task: Option<JoinHandle<()>>,
    simulator: NetworkSimulator,
}

impl ChaosHandle {
    /// Level the schedule samples from.
    pub fn level(&self) -> ChaosLevel {
        self.level
    }

    /// Stop re-rolling and clear every profile.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.simulator.clear_all();
        tracing::info!(level = self.level.as_str(), "chaos stopped");
    }
}

impl Drop for ChaosHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
