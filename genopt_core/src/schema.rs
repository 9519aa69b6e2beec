// genopt_core/src/schema.rs

//! Strategy configurations and the schema describing their search space.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::data_handler;

/// Value of a single strategy parameter.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Real(f64),
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            ParamValue::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(value) => Some(*value as f64),
            ParamValue::Real(value) => Some(*value),
            ParamValue::Bool(_) => None,
        }
    }

}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{}", value),
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Real(value) => write!(f, "{}", value),
        }
    }
}

/// One candidate strategy configuration: fixed identity fields plus tunable parameters.
/// Parameters live in a `BTreeMap`, so the serialized form is already key-sorted.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub broker: String,
    pub ticker: String,
    /// Notional amount per order.
    pub amount: f64,
    pub interval: data_handler::Interval,
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, ParamValue>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            broker: "sim".to_string(),
            ticker: "TEST".to_string(),
            amount: 1.0,
            interval: data_handler::Interval::OneMinute,
            params: std::collections::BTreeMap::new(),
        }
    }
}

impl StrategyConfig {
    pub fn new(broker: &str, ticker: &str, interval: data_handler::Interval, amount: f64) -> Self {
        Self {
            broker: broker.to_string(),
            ticker: ticker.to_string(),
            amount,
            interval,
            params: std::collections::BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: ParamValue) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn get_i64(&self, name: &str) -> anyhow::Result<i64> {
        self.params
            .get(name)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow::anyhow!("Parameter '{}' is missing or not an integer", name))
    }

    pub fn get_f64(&self, name: &str) -> anyhow::Result<f64> {
        self.params
            .get(name)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("Parameter '{}' is missing or not a number", name))
    }

    pub fn get_bool(&self, name: &str) -> anyhow::Result<bool> {
        self.params
            .get(name)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| anyhow::anyhow!("Parameter '{}' is missing or not a boolean", name))
    }

    /// Canonical text form: identity fields and key-sorted parameters.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    /// Id of the canonical form: the first 8 bytes of its SHA-256, big-endian.
    /// Stable across processes and builds.
    pub fn task_id(&self) -> TaskId {
        let digest = Sha256::digest(self.canonical().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        TaskId(u64::from_be_bytes(prefix))
    }

    /// Human-readable parameter list for logging.
    pub fn format_for_display(&self) -> String {
        let params_str = self.params
            .iter()
            .map(|(k, v)| format!("'{}': {}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{}}}", params_str)
    }

}

/// Correlates an evaluation request with its asynchronous result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Generation rule for one parameter.
///
/// Boundaries: integer ranges are inclusive on both ends; real ranges are
/// half-open `[min, max)` unless `min == max`, which always yields `min`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum SchemaDescriptor {
    Boolean,
    Integer {
        min: i64,
        max: i64,
        #[serde(default)]
        odd: bool,
    },
    Real {
        min: f64,
        max: f64,
    },
}

impl SchemaDescriptor {
    pub fn validate(&self, name: &str) -> anyhow::Result<()> {
        match self {
            SchemaDescriptor::Boolean => {}
            SchemaDescriptor::Integer { min, max, odd } => {
                if min > max {
                    anyhow::bail!("Schema parameter '{}': min {} exceeds max {}", name, min, max);
                }
                if *odd && min == max && min % 2 == 0 {
                    anyhow::bail!("Schema parameter '{}': range [{}, {}] has no odd value", name, min, max);
                }
            }
            SchemaDescriptor::Real { min, max } => {
                if !min.is_finite() || !max.is_finite() || min > max {
                    anyhow::bail!("Schema parameter '{}': invalid real range [{}, {}]", name, min, max);
                }
            }
        }

        anyhow::Ok(())
    }

    /// Draws a random value following this rule.
    pub fn random_value<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match self {
            SchemaDescriptor::Boolean => ParamValue::Bool(rng.gen_bool(0.5)),
            SchemaDescriptor::Integer { min, max, odd } => {
                let value = rng.gen_range(*min..=*max);
                if *odd && value % 2 == 0 {
                    ParamValue::Int(make_odd(value, *min, *max))
                } else {
                    ParamValue::Int(value)
                }
            }
            SchemaDescriptor::Real { min, max } => {
                if min == max {
                    ParamValue::Real(*min)
                } else {
                    ParamValue::Real(rng.gen_range(*min..*max))
                }
            }
        }
    }

}

/// Nudges an even value to a neighbouring odd one inside `[min, max]`.
fn make_odd(value: i64, min: i64, max: i64) -> i64 {
    if value < max {
        value + 1
    } else if value > min {
        value - 1
    } else {
        value
    }
}

/// Per-parameter generation rules; the key set is the search space.
pub type Schema = std::collections::BTreeMap<String, SchemaDescriptor>;

/// Outcome of a bounded validation retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    /// A candidate passed validation.
    Validated(T),
    /// Retries ran out; carries the last, unvalidated candidate.
    Exhausted(T),
}

impl<T> Attempt<T> {
    pub fn is_validated(&self) -> bool {
        matches!(self, Attempt::Validated(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Attempt::Validated(value) | Attempt::Exhausted(value) => value,
        }
    }

    /// Fails on exhaustion instead of accepting the candidate.
    pub fn into_validated(self) -> anyhow::Result<T> {
        match self {
            Attempt::Validated(value) => anyhow::Ok(value),
            Attempt::Exhausted(_) => anyhow::bail!("Validation retries exhausted"),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Attempt<U> {
        match self {
            Attempt::Validated(value) => Attempt::Validated(f(value)),
            Attempt::Exhausted(value) => Attempt::Exhausted(f(value)),
        }
    }

}
