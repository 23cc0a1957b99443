//! Hyperparameter search space and the strategies proposing candidates.

use crate::config::{OptimizerConfig, StrategyKind};
use potline_analysis::ParameterMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("Parameter path `{0}` crosses a value that is not a mapping")]
    PathConflict(String),
    #[error("Parameter path `{0}` is empty")]
    EmptyPath(String),
    #[error("Parameter `{name}` is invalid: {reason}")]
    InvalidParameter { name: String, reason: &'static str },
}

/// How one parameter is sampled, the name is a dotted path into the model config
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ParameterKind {
    /// uniform in [low, high]
    Float { low: f64, high: f64 },
    /// uniform integer in [low, high]
    Int { low: i64, high: i64 },
    /// uniform in log space
    LogUniform { low: f64, high: f64 },
    Choice { values: Vec<Value> },
}

impl ParameterKind {
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            Self::Float { low, high } | Self::LogUniform { low, high }
                if !(low.is_finite() && high.is_finite()) =>
            {
                Err("bounds must be finite")
            }
            Self::Float { low, high } if !(low <= high) => Err("low must not exceed high"),
            Self::Int { low, high } if low > high => Err("low must not exceed high"),
            Self::LogUniform { low, high } if !(0.0 < *low && low <= high) => {
                Err("log uniform bounds must be positive and ordered")
            }
            Self::Choice { values } if values.is_empty() => Err("choice needs at least one value"),
            _ => Ok(()),
        }
    }

    fn sample(&self, rng: &mut StdRng) -> Value {
        match self {
            Self::Float { low, high } => Value::from(rng.gen_range(*low..=*high)),
            Self::Int { low, high } => Value::from(rng.gen_range(*low..=*high)),
            Self::LogUniform { low, high } => {
                Value::from(rng.gen_range(low.ln()..=high.ln()).exp().clamp(*low, *high))
            }
            Self::Choice { values } => values[rng.gen_range(0..values.len())].clone(),
        }
    }

    /// Small step away from `base`, staying inside the bounds
    fn perturb(&self, base: &Value, rng: &mut StdRng) -> Value {
        match (self, base) {
            (Self::Float { low, high }, Value::Number(value)) => {
                let value = value.as_f64().unwrap_or(*low);
                let noise = rng.gen_range(-0.1..=0.1) * (high - low);
                Value::from((value + noise).clamp(*low, *high))
            }
            (Self::Int { low, high }, Value::Number(value)) => {
                let value = value.as_i64().unwrap_or(*low);
                let delta: i64 = rng.gen_range(-2..=2);
                Value::from(value.saturating_add(delta).clamp(*low, *high))
            }
            (Self::LogUniform { low, high }, Value::Number(value)) => {
                let value = value.as_f64().unwrap_or(*low).max(*low);
                let noise = rng.gen_range(-0.1..=0.1) * (high.ln() - low.ln());
                Value::from((value.ln() + noise).exp().clamp(*low, *high))
            }
            _ => self.sample(rng),
        }
    }
}

/// Proposes parameter sets and learns from their losses (lower is better)
pub trait SearchStrategy: Send {
    fn suggest(&mut self, count: usize) -> Vec<ParameterMap>;

    fn report(&mut self, _parameters: &ParameterMap, _loss: f64) {}

    fn name(&self) -> &'static str;
}

/// Independent samples of the whole space
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: BTreeMap<String, ParameterKind>,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(space: BTreeMap<String, ParameterKind>, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample_one(space: &BTreeMap<String, ParameterKind>, rng: &mut StdRng) -> ParameterMap {
        space
            .iter()
            .map(|(name, kind)| (name.clone(), kind.sample(rng)))
            .collect()
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParameterMap> {
        (0..count)
            .map(|_| Self::sample_one(&self.space, &mut self.rng))
            .collect()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Perturbs the best point seen so far, exploring at random with
/// probability `exploration` or while nothing was reported yet
#[derive(Debug, Clone)]
pub struct ExploitSearch {
    space: BTreeMap<String, ParameterKind>,
    rng: StdRng,
    exploration: f64,
    best: Option<(ParameterMap, f64)>,
}

impl ExploitSearch {
    pub fn new(space: BTreeMap<String, ParameterKind>, seed: u64, exploration: f64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
            exploration,
            best: None,
        }
    }

    fn exploit(&mut self, base: &ParameterMap) -> ParameterMap {
        self.space
            .iter()
            .map(|(name, kind)| {
                let value = match base.get(name) {
                    Some(value) => kind.perturb(value, &mut self.rng),
                    None => kind.sample(&mut self.rng),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

impl SearchStrategy for ExploitSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParameterMap> {
        (0..count)
            .map(|_| match self.best.clone() {
                Some((base, _)) if self.rng.gen::<f64>() >= self.exploration => {
                    self.exploit(&base)
                }
                _ => RandomSearch::sample_one(&self.space, &mut self.rng),
            })
            .collect()
    }

    fn report(&mut self, parameters: &ParameterMap, loss: f64) {
        if self.best.as_ref().map_or(true, |(_, best)| loss < *best) {
            self.best = Some((parameters.clone(), loss));
        }
    }

    fn name(&self) -> &'static str {
        "exploit"
    }
}

/// Strategy over the configured space, every parameter validated first
pub fn strategy(config: &OptimizerConfig) -> Result<Box<dyn SearchStrategy>, SearchError> {
    for (name, parameter) in &config.parameters {
        parameter
            .validate()
            .map_err(|reason| SearchError::InvalidParameter {
                name: name.clone(),
                reason,
            })?;
    }

    Ok(match config.strategy {
        StrategyKind::Random => Box::new(RandomSearch::new(config.parameters.clone(), config.seed)),
        StrategyKind::Exploit => Box::new(ExploitSearch::new(
            config.parameters.clone(),
            config.seed,
            0.2,
        )),
    })
}

/// Set `value` at a dotted `path`, creating intermediate mappings
pub fn set_path(mapping: &mut Mapping, path: &str, value: Value) -> Result<(), SearchError> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (parents.split('.').collect::<Vec<_>>(), leaf),
        None => (Vec::new(), path),
    };
    if leaf.is_empty() || parents.iter().any(|part| part.is_empty()) {
        return Err(SearchError::EmptyPath(path.to_owned()));
    }

    let mut current = mapping;
    for part in parents {
        let entry = current
            .entry(Value::from(part))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        current = match entry {
            Value::Mapping(inner) => inner,
            _ => return Err(SearchError::PathConflict(path.to_owned())),
        };
    }

    current.insert(Value::from(leaf), value);
    Ok(())
}

/// Model configuration of a candidate: `base` with every parameter applied
pub fn apply_parameters(base: &Mapping, parameters: &ParameterMap) -> Result<Mapping, SearchError> {
    let mut config = base.clone();
    for (path, value) in parameters {
        set_path(&mut config, path, value.clone())?;
    }
    Ok(config)
}
