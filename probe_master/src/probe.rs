//! One candidate through the whole pipeline: harness, execution, decode, verdict.

use crate::config::{ConfigError, ProbeConfig};
use crate::disasm::disassemble;
use crate::executor::Executor;
use crate::harness::HarnessGenerator;
use log::{error, info};
use probe_data::classify::classify;
use probe_data::output::OutputLayout;
use probe_data::{Outcome, ProbeResult, TestVector};
use std::time::Duration;

pub struct Prober<E> {
    generator: HarnessGenerator,
    layout: OutputLayout,
    timeout: Duration,
    executor: E,
}

impl<E: Executor> Prober<E> {
    pub fn new(config: ProbeConfig, executor: E) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            layout: config.layout(),
            timeout: config.timeout,
            generator: HarnessGenerator::new(config),
            executor,
        })
    }

    /// Never fails: anything going wrong on the way ends up in the outcome.
    pub async fn probe(&self, vector: TestVector) -> ProbeResult {
        let disassembly = disassemble(vector.as_bytes());

        let outcome = match self.generator.generate(&vector) {
            Err(err) => {
                let message = format!("Harness generation failed: {}", err);
                Outcome::weird(message, Vec::new())
            }
            Ok(image) => match self.executor.execute(&image, self.timeout).await {
                Ok(execution) => classify(execution, &self.layout),
                Err(err) => {
                    let message = format!("Execution failed: {}", err);
                    Outcome::weird(message, Vec::new())
                }
            },
        };

        ProbeResult::new(vector, outcome, disassembly)
    }

    /// A `nop` has to come back clean, otherwise this host cannot run the harness.
    pub async fn selfcheck(&self) -> bool {
        let nop = match TestVector::new(&[0x90]) {
            Ok(v) => v,
            Err(_) => return false,
        };

        let result = self.probe(nop).await;
        match &result.outcome {
            Outcome::Good(effects) if effects.is_empty() => {
                info!("Selfcheck passed: {}", result);
                true
            }
            _ => {
                error!("Selfcheck: unexpected result for nop: {}", result);
                false
            }
        }
    }
}
