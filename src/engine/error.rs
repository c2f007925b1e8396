use thiserror::Error;

/// Errors raised while preparing configuration on the control thread.
///
/// Nothing on the audio thread returns these; it falls back to silence or
/// keeps its previous state instead.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("unknown operator kind '{kind}' for operator '{id}'")]
  UnknownOperator { id: String, kind: String },

  #[error("duplicate operator id '{0}'")]
  DuplicateOperator(String),

  #[error("unknown parameter '{0}'")]
  UnknownParam(String),

  #[error("parameter '{path}' expects {expected}, got {found}")]
  ParamType { path: String, expected: &'static str, found: &'static str },

  #[error("invalid value for '{path}': {message}")]
  InvalidValue { path: String, message: String },

  #[error("operator '{op}' references missing operator '{target}'")]
  MissingOperator { op: String, target: String },

  #[error("unknown instrument '{0}'")]
  UnknownInstrument(String),

  #[error("plan declares more than one output operator")]
  MultipleOutputs,

  #[error("configuration exchange disconnected")]
  Disconnected,

  #[error("audio device: {0}")]
  Device(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
