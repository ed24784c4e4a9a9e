//! The demonstration [`CodeEvaluator`](sies_core::CodeEvaluator): a toy
//! "language" whose only forms are a bare JSON literal, `print:<text>`,
//! `input:<prompt>`, and `sleep:<ms>` — just enough surface to exercise the
//! result path, the output redirector, the `input()` shim, and cooperative
//! cancellation without embedding a real interpreter (spec.md §4.4 leaves
//! the evaluator an out-of-crate collaborator; this one exists only to
//! drive `sies-cli`).

use sies_core::cancel::CancelTracer;
use sies_core::evaluator::{CodeEvaluator, EvalOutcome};
use sies_core::input_shim::InputShim;
use sies_core::namespace::NamespaceStore;
use sies_core::pump::OutputWriter;
use sies_wire::StreamKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ToyEvaluator;

impl CodeEvaluator for ToyEvaluator {
    fn evaluate(
        &self,
        code: &str,
        _namespace: &Arc<dyn NamespaceStore>,
        tracer: &CancelTracer,
        input: &InputShim,
        output: &OutputWriter,
    ) -> EvalOutcome {
        let code = code.trim();

        if let Some(text) = code.strip_prefix("print:") {
            if let Err(e) = output.write(StreamKind::Stdout, format!("{text}\n").as_bytes()) {
                return EvalOutcome::Exception {
                    exception_type: "OutputError".to_string(),
                    message: e.to_string(),
                    traceback: None,
                };
            }
            return EvalOutcome::Value {
                value: serde_json::Value::Null,
                repr: "None".to_string(),
            };
        }

        if let Some(prompt) = code.strip_prefix("input:") {
            return match input.request(prompt, None) {
                Ok(data) => EvalOutcome::Value {
                    value: serde_json::Value::String(data.clone()),
                    repr: format!("{data:?}"),
                },
                Err(e) => EvalOutcome::Exception {
                    exception_type: "InputError".to_string(),
                    message: e.to_string(),
                    traceback: None,
                },
            };
        }

        if let Some(ms) = code.strip_prefix("sleep:") {
            let Ok(ms) = ms.trim().parse::<u64>() else {
                return EvalOutcome::Exception {
                    exception_type: "ValueError".to_string(),
                    message: format!("sleep: expects an integer millisecond count, got {ms:?}"),
                    traceback: None,
                };
            };
            return self.sleep_cooperatively(Duration::from_millis(ms), tracer);
        }

        match serde_json::from_str::<serde_json::Value>(code) {
            Ok(value) => {
                let repr = value.to_string();
                EvalOutcome::Value { value, repr }
            }
            Err(e) => EvalOutcome::Exception {
                exception_type: "SyntaxError".to_string(),
                message: format!("not a recognized literal: {e}"),
                traceback: None,
            },
        }
    }
}

impl ToyEvaluator {
    /// Busy-waits in small ticks so `tracer.should_interrupt` gets a chance
    /// to fire at its configured cadence, demonstrating spec.md §4.4.2/3's
    /// cooperative cancellation without a real interpreter's line events.
    fn sleep_cooperatively(&self, duration: Duration, tracer: &CancelTracer) -> EvalOutcome {
        let deadline = Instant::now() + duration;
        let mut ticks: u64 = 0;
        loop {
            ticks += 1;
            if tracer.should_interrupt(ticks) {
                return EvalOutcome::Exception {
                    exception_type: "KeyboardInterrupt".to_string(),
                    message: "sleep interrupted by cancel()".to_string(),
                    traceback: None,
                };
            }
            if Instant::now() >= deadline {
                return EvalOutcome::Value {
                    value: serde_json::Value::Null,
                    repr: "None".to_string(),
                };
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
