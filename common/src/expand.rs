use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::job::CreateJobRequest;

/// Upper bound on the number of payloads a single job may expand into.
pub const MAX_PAYLOADS_PER_JOB: usize = 100_000;

/// Inclusive integer range, e.g. `{"min": 10, "max": 50, "step": 10}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: i64,
    pub max: i64,
    #[serde(default = "default_step")]
    pub step: i64,
}

fn default_step() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    #[error("range `{name}` is invalid: {reason}")]
    InvalidRange { name: &'static str, reason: String },

    #[error("job has no payloads: give `payloads` or at least one algorithm")]
    Empty,

    #[error("job expands into {0} payloads, more than the allowed 100000")]
    TooLarge(usize),
}

impl ParamRange {
    pub fn single(value: i64) -> Self {
        Self {
            min: value,
            max: value,
            step: 1,
        }
    }

    fn values(&self, name: &'static str) -> Result<Vec<i64>, ExpandError> {
        if self.step <= 0 {
            return Err(ExpandError::InvalidRange {
                name,
                reason: format!("step must be positive, got {}", self.step),
            });
        }
        if self.min > self.max {
            return Err(ExpandError::InvalidRange {
                name,
                reason: format!("min {} is greater than max {}", self.min, self.max),
            });
        }
        let count = (self.max as i128 - self.min as i128) / self.step as i128 + 1;
        if count > MAX_PAYLOADS_PER_JOB as i128 {
            return Err(ExpandError::TooLarge(count.min(usize::MAX as i128) as usize));
        }
        Ok((0..count as i64).map(|i| self.min + i * self.step).collect())
    }
}

fn axis(range: Option<&ParamRange>, name: &'static str) -> Result<Vec<Option<i64>>, ExpandError> {
    match range {
        Some(r) => Ok(r.values(name)?.into_iter().map(Some).collect()),
        None => Ok(vec![None]),
    }
}

/// Turns a job request into its task payloads.
///
/// Explicit `payloads` win. Otherwise every combination of
/// algorithm x iterations x agents x dimension becomes one payload object
/// carrying the artifact and main reference. Axes without a range are left
/// out of the payload.
pub fn expand_payloads(req: &CreateJobRequest) -> Result<Vec<Value>, ExpandError> {
    if let Some(payloads) = &req.payloads {
        if payloads.is_empty() {
            return Err(ExpandError::Empty);
        }
        if payloads.len() > MAX_PAYLOADS_PER_JOB {
            return Err(ExpandError::TooLarge(payloads.len()));
        }
        return Ok(payloads.clone());
    }

    if req.algorithms.is_empty() {
        return Err(ExpandError::Empty);
    }

    let iterations = axis(req.iterations.as_ref(), "iterations")?;
    let agents = axis(req.agents.as_ref(), "agents")?;
    let dimension = axis(req.dimension.as_ref(), "dimension")?;

    let total = req.algorithms.len() * iterations.len() * agents.len() * dimension.len();
    if total > MAX_PAYLOADS_PER_JOB {
        return Err(ExpandError::TooLarge(total));
    }

    let mut out = Vec::with_capacity(total);
    for alg in &req.algorithms {
        for it in &iterations {
            for ag in &agents {
                for dim in &dimension {
                    let mut obj = Map::new();
                    obj.insert("artifact".into(), json!(req.artifact));
                    if let Some(main_ref) = &req.main_ref {
                        obj.insert("mainRef".into(), json!(main_ref));
                    }
                    obj.insert("alg".into(), json!(alg));
                    if let Some(v) = it {
                        obj.insert("iterations".into(), json!(v));
                    }
                    if let Some(v) = ag {
                        obj.insert("agents".into(), json!(v));
                    }
                    if let Some(v) = dim {
                        obj.insert("dimension".into(), json!(v));
                    }
                    out.push(Value::Object(obj));
                }
            }
        }
    }
    Ok(out)
}
