use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Malformed Dockerfile line, unknown instruction or bad flag
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Invalid parser directive in the Dockerfile header
    #[error("directive error: {0}")]
    Directive(String),

    /// Stage graph or scope error detected before any instruction runs
    #[error("{0}")]
    Semantic(String),

    /// Word expansion failure (unterminated quote, unresolved variable in strict mode)
    #[error("expansion error: {0}")]
    Expansion(String),

    /// Failure while building one instruction of a stage
    #[error("stage {stage}, line {line} ({command}): {source}")]
    Instruction {
        stage: String,
        line: usize,
        command: String,
        #[source]
        source: Box<KilnError>,
    },

    /// Image could not be resolved by the image store
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image/layer store failure
    #[error("store error: {0}")]
    Store(String),

    /// RUN process exited with a non-zero status
    #[error("command '{command}' exited with code {code}")]
    RunFailed { command: String, code: i32 },

    /// RUN process was terminated by a signal
    #[error("command '{command}' terminated by signal {signal}")]
    RunSignaled { command: String, signal: i32 },

    /// OCI runtime could not be launched
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Export failure
    #[error("export error: {0}")]
    Export(String),

    /// Invalid image name or tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Build cancelled by the caller
    #[error("build cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KilnError {
    /// Shorthand for a syntax error on a given source line.
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        KilnError::Syntax {
            line,
            message: message.into(),
        }
    }

    /// Wrap this error with the stage and instruction it occurred in.
    pub fn in_instruction(self, stage: &str, line: usize, command: &str) -> Self {
        KilnError::Instruction {
            stage: stage.to_string(),
            line,
            command: command.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost error, unwrapping instruction context.
    pub fn root_cause(&self) -> &KilnError {
        match self {
            KilnError::Instruction { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
