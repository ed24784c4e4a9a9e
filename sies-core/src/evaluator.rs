//! The external `CodeEvaluator` collaborator (spec §4.4 step 3). The core
//! does not embed a language runtime; it drives whatever evaluator is
//! plugged in the same way `ahma_mcp`'s adapter drives an external shell
//! process rather than a builtin one.

use crate::cancel::CancelTracer;
use crate::input_shim::InputShim;
use crate::namespace::NamespaceStore;
use crate::pump::OutputWriter;
use std::sync::Arc;

/// The result of evaluating one `execute.code` body.
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    /// A clean evaluation. `value`/`repr` hold the trailing expression's
    /// value when `code` was a single expression; otherwise `value` is
    /// `Null` and `repr` is `"None"` (spec §4.4 step 3).
    Value {
        value: serde_json::Value,
        repr: String,
    },
    /// A user-code exception, captured rather than propagated (spec §4.4
    /// step 4: "No exception escapes `execute`").
    Exception {
        exception_type: String,
        message: String,
        traceback: Option<String>,
    },
}

/// Implemented by whatever language runtime is embedded. `sies-core` ships
/// no implementation beyond what tests need; a real binary supplies its
/// own (e.g. an embedded scripting language's interpreter).
///
/// Evaluation runs synchronously on a dedicated OS thread (spec §4.4 step
/// 3); this trait's method is therefore plain, blocking Rust rather than
/// `async`.
pub trait CodeEvaluator: Send + Sync + 'static {
    /// Compile and run `code` against `namespace`, calling
    /// `tracer.should_interrupt(n)` at the evaluator's own notion of a line
    /// event and raising/aborting when it returns `true`. `input` is the
    /// shim a real evaluator binds as the namespace's `input()` symbol
    /// (spec §4.4.1); `output` is the stdout/stderr writer override (spec
    /// §4.7) — this trait exposes both explicitly since the
    /// `NamespaceStore` contract treats namespace contents as opaque.
    fn evaluate(
        &self,
        code: &str,
        namespace: &Arc<dyn NamespaceStore>,
        tracer: &CancelTracer,
        input: &InputShim,
        output: &OutputWriter,
    ) -> EvalOutcome;
}
