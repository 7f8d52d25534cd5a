pub mod script;
pub mod shell;

use crate::config::EngineConfig;
use crate::protocol::StreamKind;
use crate::session::AskError;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine invocation failed: {0}")]
    Invocation(String),
    #[error("engine panicked: {0}")]
    Panicked(String),
}

/// Completion status as judged by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellStatus {
    pub success: bool,
}

impl CellStatus {
    pub fn ok() -> Self {
        Self { success: true }
    }

    pub fn failed() -> Self {
        Self { success: false }
    }
}

/// Where an engine writes the output of the cell it is running.
pub trait CellOutput {
    fn write(&mut self, stream: StreamKind, text: &str);
}

/// Operations running code may call back into the session with.
pub trait Capabilities {
    /// Ask the client a question and block this execution until it answers.
    fn ask(&self, prompt: &str) -> Result<String, AskError>;
    /// Send the client a message that expects no reply.
    fn notice(&self, message: &str);
}

pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Run one cell. Failures inside the submitted code are the engine's to report as output
    /// plus `CellStatus::failed()`; `Err` is reserved for failures of the engine itself.
    fn run_cell(
        &self,
        code: &str,
        out: &mut dyn CellOutput,
        caps: &dyn Capabilities,
    ) -> Result<CellStatus, EngineError>;
}

/// The engine instance a session shares between all of its executions.
///
/// Cells running at the same time see and mutate the same engine state (variables, working
/// directory). Nothing here serializes or isolates them; ordering between concurrent cells
/// is up to the client.
#[derive(Clone)]
pub struct SharedExecutionContext {
    engine: Arc<dyn Engine>,
}

impl SharedExecutionContext {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }
}

/// Build a fresh engine for one session.
pub fn from_config(cfg: &EngineConfig) -> Result<Arc<dyn Engine>, EngineError> {
    match cfg.kind.as_str() {
        "script" => Ok(Arc::new(script::ScriptEngine::new())),
        "shell" => Ok(Arc::new(shell::ShellEngine::new(
            &cfg.shell,
            std::time::Duration::from_secs(cfg.shell_timeout_secs),
        )?)),
        other => Err(EngineError::Setup(format!("unknown engine kind '{}'", other))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_script() {
        let engine = from_config(&EngineConfig::default()).unwrap();
        assert_eq!(engine.name(), "script");
    }

    #[test]
    fn test_from_config_shell() {
        let cfg = EngineConfig {
            kind: "shell".to_string(),
            ..EngineConfig::default()
        };
        let engine = from_config(&cfg).unwrap();
        assert_eq!(engine.name(), "shell");
    }

    #[test]
    fn test_from_config_unknown_kind() {
        let cfg = EngineConfig {
            kind: "cobol".to_string(),
            ..EngineConfig::default()
        };
        let err = from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Invocation("boom".to_string());
        assert_eq!(err.to_string(), "engine invocation failed: boom");
        let err = EngineError::Setup("x".to_string());
        assert!(err.to_string().contains("setup"));
    }
}
