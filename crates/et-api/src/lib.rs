#![forbid(unsafe_code)]

use std::fmt;

use et_core::ExecutionMode;
use et_function::FunctionError;
use et_interp::{InterpError, InterpretedFunction};
use et_optimize::{OptimizeReport, optimize};
use et_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};
use et_serialize::{SerializeError, decode_value, encode_value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Function(FunctionError),
    Interp(InterpError),
    Serialize(SerializeError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(error) => write!(f, "function error: {error}"),
            Self::Interp(error) => write!(f, "evaluation error: {error}"),
            Self::Serialize(error) => write!(f, "serialization error: {error}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Function(error) => Some(error),
            Self::Interp(error) => Some(error),
            Self::Serialize(error) => Some(error),
        }
    }
}

impl From<FunctionError> for SessionError {
    fn from(value: FunctionError) -> Self {
        Self::Function(value)
    }
}

impl From<InterpError> for SessionError {
    fn from(value: InterpError) -> Self {
        Self::Interp(value)
    }
}

impl From<SerializeError> for SessionError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

/// Optimized function tree together with its compiled program.
#[derive(Debug, Clone)]
pub struct PreparedFunction {
    arena: FunctionArena,
    report: OptimizeReport,
    function: InterpretedFunction,
}

impl PreparedFunction {
    #[must_use]
    pub fn arena(&self) -> &FunctionArena {
        &self.arena
    }

    #[must_use]
    pub fn report(&self) -> &OptimizeReport {
        &self.report
    }

    #[must_use]
    pub fn function(&self) -> &InterpretedFunction {
        &self.function
    }

    #[must_use]
    pub fn kernels(&self) -> Vec<&'static str> {
        self.function.kernels()
    }

    /// Nested node names of the optimized tree, e.g. `reduce(join(inject, inject))`.
    #[must_use]
    pub fn dump(&self) -> String {
        self.arena
            .root()
            .map_or_else(String::new, |root| self.arena.dump(root))
    }
}

pub struct EvalSession {
    runtime: RuntimeContext,
}

impl EvalSession {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            runtime: RuntimeContext::new(config),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.runtime.config()
    }

    /// Optimizes a copy of `arena` when enabled and compiles it in the
    /// session's current mode.
    pub fn prepare(&mut self, arena: &FunctionArena) -> Result<PreparedFunction, SessionError> {
        let config = *self.runtime.config();
        let mut arena = arena.clone();
        let report = if config.optimize {
            optimize(&mut arena, &config.passes)?
        } else {
            arena.root().ok_or(FunctionError::NoRoot)?;
            OptimizeReport::default()
        };
        for rewrite in &report.rewrites {
            self.runtime.ledger_mut().record(
                EvidenceKind::Optimize,
                format!(
                    "matcher={} node={} replacement={} from={} to={}",
                    rewrite.matcher,
                    rewrite.node.0,
                    rewrite.replacement.0,
                    rewrite.from,
                    rewrite.to
                ),
            );
        }
        let function = InterpretedFunction::compile(&arena, config.mode)?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Compile,
            format!(
                "instructions={} params={} result={} mode={:?}",
                function.program().len(),
                function.num_params(),
                function.result_type(),
                config.mode
            ),
        );
        debug!(rewrites = report.len(), "tensor function prepared");
        Ok(PreparedFunction {
            arena,
            report,
            function,
        })
    }

    pub fn eval(
        &mut self,
        prepared: &PreparedFunction,
        params: &[Value],
    ) -> Result<Value, SessionError> {
        let result = prepared.function.eval(params);
        let summary = match &result {
            Ok(value) => format!(
                "params={} result={} error={}",
                params.len(),
                value.value_type(),
                value.is_error()
            ),
            Err(error) => format!("params={} failed: {error}", params.len()),
        };
        self.runtime
            .ledger_mut()
            .record(EvidenceKind::Evaluate, summary);
        result.map_err(SessionError::from)
    }

    /// Evaluates with parameters and result in the binary tensor format.
    pub fn eval_encoded(
        &mut self,
        prepared: &PreparedFunction,
        params: &[&[u8]],
    ) -> Result<Vec<u8>, SessionError> {
        let mut values = Vec::with_capacity(params.len());
        for (idx, bytes) in params.iter().enumerate() {
            match decode_value(bytes) {
                Ok(value) => values.push(value),
                Err(error) => {
                    self.runtime
                        .record_decode_failure(&format!("param {idx}"), &error);
                    return Err(error.into());
                }
            }
        }
        let result = self.eval(prepared, &values)?;
        let encoded = encode_value(&result)?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Serialize,
            format!("encoded result bytes={}", encoded.len()),
        );
        Ok(encoded)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }
}

pub use et_function::FunctionArena;
pub use et_runtime::EngineConfig;
pub use et_storage::Value;

#[cfg(test)]
mod tests {
    use et_core::{Aggr, ExecutionMode, Op1, Op2, ValueType};
    use et_function::FunctionArena;
    use et_interp::InterpError;
    use et_runtime::{EngineConfig, EvidenceKind};
    use et_serialize::encode_value;
    use et_storage::Value;

    use super::{EvalSession, SessionError};

    fn ty(spec: &str) -> ValueType {
        ValueType::from_spec(spec)
    }

    fn dot_function() -> FunctionArena {
        let mut arena = FunctionArena::new();
        let a = arena.inject(ty("tensor(x[3])"), 0);
        let b = arena.inject(ty("tensor(x[3])"), 1);
        let product = arena.join(a, b, Op2::Mul);
        let root = arena.reduce(product, Aggr::Sum, &["x"]);
        arena.set_root(root);
        arena
    }

    fn vec3(cells: &[f64]) -> Value {
        Value::dense_from_f64(ty("tensor(x[3])"), cells)
    }

    #[test]
    fn session_prepare_and_eval_records_evidence() {
        let mut session = EvalSession::new(EngineConfig::default());
        let prepared = session.prepare(&dot_function()).expect("prepare should succeed");
        assert_eq!(prepared.dump(), "dot_product(inject, inject)");
        assert_eq!(prepared.report().count("dot_product"), 1);

        let value = session
            .eval(&prepared, &[vec3(&[1.0, 2.0, 3.0]), vec3(&[4.0, 5.0, 6.0])])
            .expect("eval should succeed");
        assert_eq!(value.as_double(), 32.0);

        let kinds: Vec<EvidenceKind> = session.evidence().iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EvidenceKind::Policy,
                EvidenceKind::Optimize,
                EvidenceKind::Compile,
                EvidenceKind::Evaluate
            ]
        );
        assert!(session.evidence()[1].summary.contains("matcher=dot_product"));
    }

    #[test]
    fn unoptimized_sessions_run_generic_instructions() {
        let mut session = EvalSession::new(EngineConfig::default().unoptimized());
        let prepared = session.prepare(&dot_function()).expect("prepare should succeed");
        assert!(prepared.report().is_empty());
        assert_eq!(
            prepared.kernels(),
            vec!["inject", "inject", "generic_join", "generic_reduce"]
        );
        let value = session
            .eval(&prepared, &[vec3(&[1.0, 2.0, 3.0]), vec3(&[4.0, 5.0, 6.0])])
            .expect("eval should succeed");
        assert_eq!(value.as_double(), 32.0);
    }

    #[test]
    fn missing_root_is_a_function_error() {
        let mut session = EvalSession::new(EngineConfig::default());
        let err = session
            .prepare(&FunctionArena::new())
            .expect_err("rootless function must fail");
        assert!(matches!(err, SessionError::Function(_)));
    }

    #[test]
    fn mode_switch_applies_to_later_preparations() {
        let mut session = EvalSession::new(EngineConfig::default());
        let strict = session.prepare(&dot_function()).expect("prepare should succeed");
        session.set_mode(ExecutionMode::Hardened);
        assert_eq!(session.mode(), ExecutionMode::Hardened);
        let hardened = session.prepare(&dot_function()).expect("prepare should succeed");

        let wrong = [vec3(&[1.0, 2.0, 3.0]), Value::double(1.0)];
        let err = session.eval(&strict, &wrong).expect_err("strict rejects");
        assert!(matches!(
            err,
            SessionError::Interp(InterpError::ParamType { index: 1, .. })
        ));
        let value = session.eval(&hardened, &wrong).expect("hardened answers");
        assert!(value.is_error());
        let last = session.evidence().last().expect("evidence should exist");
        assert!(last.summary.contains("error=true"));
    }

    #[test]
    fn encoded_eval_round_trips_binary_values() {
        let mut session = EvalSession::new(EngineConfig::default());
        let mut arena = FunctionArena::new();
        let a = arena.inject(ty("tensor(x[3])"), 0);
        let root = arena.map(a, Op1::Neg);
        arena.set_root(root);
        let prepared = session.prepare(&arena).expect("prepare should succeed");

        let param = encode_value(&vec3(&[1.0, 2.0, 3.0])).expect("encodes");
        let out = session
            .eval_encoded(&prepared, &[param.as_slice()])
            .expect("encoded eval should succeed");
        let decoded = et_serialize::decode_value(&out).expect("result decodes");
        assert_eq!(decoded.cells().to_f64_vec(), vec![-1.0, -2.0, -3.0]);
        assert_eq!(
            session.evidence().last().map(|entry| entry.kind),
            Some(EvidenceKind::Serialize)
        );
    }

    #[test]
    fn undecodable_params_are_serialize_errors() {
        let mut session = EvalSession::new(EngineConfig::default());
        let prepared = session.prepare(&dot_function()).expect("prepare should succeed");
        let params: [&[u8]; 2] = [&[0x02], &[]];
        let err = session
            .eval_encoded(&prepared, &params)
            .expect_err("truncated input must fail");
        assert!(matches!(err, SessionError::Serialize(_)));
        let last = session.evidence().last().expect("evidence should exist");
        assert_eq!(last.kind, EvidenceKind::Serialize);
        assert!(last.summary.contains("param 0"));
    }

    #[test]
    fn session_error_display_coverage() {
        let err = SessionError::from(et_function::FunctionError::NoRoot);
        assert!(err.to_string().contains("no root"));
    }
}
