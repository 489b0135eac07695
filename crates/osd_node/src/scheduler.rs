//! Weighted fair queueing across quality classes.
//!
//! Deficit round robin: each backlogged class receives `quantum * weight`
//! credit per turn and is served while its head request's cost fits into the
//! accumulated credit. Over a backlogged interval every class therefore gets
//! a share of the served cost proportional to its weight.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::queue::Discipline;
use crate::request::StageRequest;

/// Grouping key for fairness: capability priority plus volume.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QualityClass {
    pub priority: u32,
    pub volume: String,
}

pub trait Scheduled {
    fn quality_class(&self) -> QualityClass;
    fn cost(&self) -> u64;
}

impl Scheduled for StageRequest {
    fn quality_class(&self) -> QualityClass {
        QualityClass {
            priority: self.capability.as_ref().map_or(0, |cap| cap.priority),
            volume: self.file_id.volume().to_string(),
        }
    }

    fn cost(&self) -> u64 {
        StageRequest::cost(self)
    }
}

fn default_quantum() -> u64 {
    64 * 1024
}

fn default_weight() -> u32 {
    1
}

/// Weights per quality class, loadable from JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosConfig {
    /// Credit granted per turn for weight 1, in cost units (bytes).
    #[serde(default = "default_quantum")]
    pub quantum: u64,
    #[serde(default = "default_weight")]
    pub default_weight: u32,
    #[serde(default)]
    pub priority_weights: BTreeMap<u32, u32>,
    /// Takes precedence over the priority weight.
    #[serde(default)]
    pub volume_weights: BTreeMap<String, u32>,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            quantum: default_quantum(),
            default_weight: default_weight(),
            priority_weights: BTreeMap::new(),
            volume_weights: BTreeMap::new(),
        }
    }
}

impl QosConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("read qos config {}", path.display()))?;
        serde_json::from_slice(&data).context("parse qos config")
    }

    pub fn weight_for(&self, class: &QualityClass) -> u32 {
        self.volume_weights
            .get(&class.volume)
            .or_else(|| self.priority_weights.get(&class.priority))
            .copied()
            .unwrap_or(self.default_weight)
            .max(1)
    }
}

struct ClassQueue<T> {
    weight: u32,
    deficit: u64,
    items: VecDeque<T>,
}

pub struct WeightedFairQueue<T> {
    config: QosConfig,
    classes: HashMap<QualityClass, ClassQueue<T>>,
    /// Backlogged classes waiting for their next turn.
    active: VecDeque<QualityClass>,
    /// Class whose turn is in progress.
    current: Option<QualityClass>,
    len: usize,
}

impl<T: Scheduled> WeightedFairQueue<T> {
    pub fn new(config: QosConfig) -> Self {
        Self {
            config,
            classes: HashMap::new(),
            active: VecDeque::new(),
            current: None,
            len: 0,
        }
    }

    pub fn backlogged_classes(&self) -> usize {
        self.classes.len()
    }
}

impl<T: Scheduled + Send> Discipline<T> for WeightedFairQueue<T> {
    fn push(&mut self, item: T) {
        let key = item.quality_class();
        let weight = self.config.weight_for(&key);
        let class = self.classes.entry(key.clone()).or_insert_with(|| ClassQueue {
            weight,
            deficit: 0,
            items: VecDeque::new(),
        });
        let newly_backlogged = class.items.is_empty();
        class.items.push_back(item);
        self.len += 1;
        if newly_backlogged && self.current.as_ref() != Some(&key) {
            self.active.push_back(key);
        }
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let quantum = self.config.quantum.max(1);
        loop {
            let key = match self.current.clone() {
                Some(key) => key,
                None => {
                    let key = self.active.pop_front()?;
                    let class = self.classes.get_mut(&key)?;
                    class.deficit = class
                        .deficit
                        .saturating_add(quantum.saturating_mul(u64::from(class.weight)));
                    self.current = Some(key.clone());
                    key
                }
            };

            let class = self.classes.get_mut(&key)?;
            let Some(cost) = class.items.front().map(Scheduled::cost) else {
                self.classes.remove(&key);
                self.current = None;
                continue;
            };

            // A lone backlogged class never waits for credit.
            if cost <= class.deficit || self.active.is_empty() {
                class.deficit = class.deficit.saturating_sub(cost);
                let item = class.items.pop_front();
                self.len -= 1;
                if class.items.is_empty() {
                    self.classes.remove(&key);
                    self.current = None;
                }
                return item;
            }

            // Turn over; the remaining credit carries into the next round.
            self.current = None;
            self.active.push_back(key);
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}
