#![forbid(unsafe_code)]

use std::fmt;

use et_core::ExecutionMode;
use et_optimize::PassConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Policy,
    Optimize,
    Compile,
    Evaluate,
    Serialize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        let summary = summary.into();
        debug!(?kind, %summary, "evidence recorded");
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Engine settings. Unknown fields are rejected so a misspelled pass name
/// cannot silently leave a pass enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub mode: ExecutionMode,
    pub optimize: bool,
    pub passes: PassConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Strict,
            optimize: true,
            passes: PassConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Same mode, no rewrites: every node runs through its generic
    /// instruction.
    #[must_use]
    pub fn unoptimized(mut self) -> Self {
        self.optimize = false;
        self
    }

    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(|error| ConfigError::InvalidJson {
            diagnostic: error.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|error| ConfigError::InvalidJson {
            diagnostic: error.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidJson { diagnostic: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => {
                write!(f, "invalid engine config json: {diagnostic}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    config: EngineConfig,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "mode initialized to {:?} optimize={}",
                config.mode, config.optimize
            ),
        );
        Self { config, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.config.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_passes(&mut self, passes: PassConfig) {
        self.config.passes = passes;
        self.ledger
            .record(EvidenceKind::Policy, format!("passes set to {passes:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_decode_failure<E>(&mut self, context: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Serialize,
            format!("value decode failure context={context}: {error}"),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use et_core::ExecutionMode;
    use et_optimize::PassConfig;
    use et_serialize::decode_value;

    use super::{ConfigError, EngineConfig, EvidenceKind, RuntimeContext};

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(EngineConfig::default());
        ctx.ledger_mut()
            .record(EvidenceKind::Optimize, "dot_product at node 3");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[0].kind, EvidenceKind::Policy);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Optimize);
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Optimize).count(), 1);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(EngineConfig::default());
        ctx.set_mode(ExecutionMode::Hardened);
        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.config().mode, ExecutionMode::Hardened);
        let last = ctx.ledger().entries().last().expect("entry should exist");
        assert_eq!(last.kind, EvidenceKind::Policy);
        assert!(last.summary.contains("Hardened"));
    }

    #[test]
    fn pass_changes_are_recorded() {
        let mut ctx = RuntimeContext::new(EngineConfig::default());
        ctx.set_passes(PassConfig::disabled());
        assert_eq!(ctx.config().passes, PassConfig::disabled());
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Policy).count(), 2);
    }

    #[test]
    fn decode_failures_are_recorded_as_serialize_evidence() {
        let mut ctx = RuntimeContext::new(EngineConfig::default());
        let error = decode_value(&[0x02]).expect_err("truncated payload must fail");
        ctx.record_decode_failure("param 0", &error);
        let last = ctx.ledger().entries().last().expect("entry should exist");
        assert_eq!(last.kind, EvidenceKind::Serialize);
        assert!(last.summary.contains("param 0"));
    }

    #[test]
    fn config_defaults_enable_everything() {
        let config = EngineConfig::from_json("{}").expect("empty object uses defaults");
        assert_eq!(config, EngineConfig::default());
        assert!(config.optimize);
        assert_eq!(config.passes, PassConfig::default());
    }

    #[test]
    fn config_json_overrides_nested_passes() {
        let config = EngineConfig::from_json(
            r#"{"mode":"hardened","optimize":true,"passes":{"inplace":false}}"#,
        )
        .expect("config should parse");
        assert_eq!(config.mode, ExecutionMode::Hardened);
        assert!(!config.passes.inplace);
        assert!(config.passes.products);

        let encoded = config.to_json().expect("config should encode");
        let decoded = EngineConfig::from_json(&encoded).expect("encoded config should parse");
        assert_eq!(decoded, config);
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let err = EngineConfig::from_json(r#"{"optimise":false}"#)
            .expect_err("misspelled field must fail");
        assert!(matches!(err, ConfigError::InvalidJson { .. }));
        assert!(err.to_string().contains("optimise"));

        let err = EngineConfig::from_json(r#"{"passes":{"matmul":false}}"#)
            .expect_err("unknown pass must fail");
        assert!(matches!(err, ConfigError::InvalidJson { .. }));
    }

    #[test]
    fn unoptimized_keeps_mode() {
        let config = EngineConfig::default()
            .with_mode(ExecutionMode::Hardened)
            .unoptimized();
        assert_eq!(config.mode, ExecutionMode::Hardened);
        assert!(!config.optimize);
    }
}
