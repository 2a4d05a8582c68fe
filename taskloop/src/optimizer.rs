//! Oracle-assisted refinement of action arguments.

use std::time::Duration;

use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::ActionArgs;
use crate::io::bridge::Bridge;
use crate::io::oracle::DecisionOracle;

pub struct ArgumentOptimizer<'a> {
    oracle: &'a dyn DecisionOracle,
    bridge: &'a Bridge,
    timeout: Duration,
}

impl<'a> ArgumentOptimizer<'a> {
    pub fn new(oracle: &'a dyn DecisionOracle, bridge: &'a Bridge, timeout: Duration) -> Self {
        Self {
            oracle,
            bridge,
            timeout,
        }
    }

    /// Refined arguments, or `args` unchanged when the oracle fails or its
    /// refinement does not satisfy `schema`.
    #[instrument(skip_all, fields(action = %action))]
    pub fn optimize(&self, action: &str, args: &ActionArgs, task: &str, schema: &Value) -> ActionArgs {
        let refined = match self.bridge.call(
            "optimize_args",
            self.timeout,
            self.oracle.optimize_args(action, args, task, schema),
        ) {
            Ok(refined) => refined,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "argument optimization failed; keeping original args");
                return args.clone();
            }
        };

        let validator = match validator_for(schema) {
            Ok(validator) => validator,
            Err(err) => {
                warn!(err = %err, "action schema does not compile; keeping original args");
                return args.clone();
            }
        };
        let candidate = Value::Object(refined.clone());
        if !validator.is_valid(&candidate) {
            let messages: Vec<String> = validator
                .iter_errors(&candidate)
                .map(|err| err.to_string())
                .collect();
            warn!(errors = %messages.join("; "), "optimized args violate schema; keeping original args");
            return args.clone();
        }

        if &refined != args {
            debug!("arguments adjusted");
        }
        refined
    }
}
