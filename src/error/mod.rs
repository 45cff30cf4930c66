
use std::fmt;

pub mod testing;

/// Main error type for the denorm crate
#[derive(Debug, Clone, PartialEq)]
pub enum DenormError {
    // ============ Configuration Errors (42xxx) ============
    /// Trigger subject is not a known relation kind
    UnsupportedSubject {
        description: String,
    },

    /// Field-change condition built with no fields
    EmptyFieldChange {
        table: String,
    },

    /// Identifier failed validation
    InvalidIdentifier {
        identifier: String,
        reason: String,
    },

    /// Model label not present in the model graph
    ModelNotFound {
        model: String,
    },

    /// Field not present on a model
    FieldNotFound {
        model: String,
        field: String,
    },

    /// No relation connects two models
    RelationNotFound {
        from: String,
        to: String,
    },

    /// More than one relation connects two models and none was chosen
    AmbiguousRelation {
        from: String,
        to: String,
        candidates: Vec<String>,
    },

    /// Configuration error (invalid settings)
    ConfigError {
        setting: String,
        value: String,
        reason: String,
    },

    // ============ Lifecycle Errors (55xxx) ============
    /// Rule used before `setup()` resolved its dependencies
    NotSetUp {
        model: String,
        field: String,
    },

    /// `setup()` called twice on the same rule
    AlreadySetUp {
        model: String,
        field: String,
    },

    /// Model is swapped out for a substitute and cannot own rules
    SwappedModel {
        model: String,
    },

    /// Another rule already owns this (model, field) pair
    DuplicateRegistration {
        model: String,
        field: String,
    },

    // ============ Rendering Errors (0A000) ============
    /// Fragment has no rendering in the active dialect
    UnsupportedFragment {
        fragment: String,
        dialect: String,
    },

    /// Placeholder count differs from the bound parameter count
    ParameterMismatch {
        placeholders: usize,
        params: usize,
    },

    // ============ Database Errors ============
    /// Statement failed inside the database
    Database {
        operation: String,
        code: Option<String>,
        message: String,
    },

    /// Trigger DDL failed for a specific rule
    InstallFailed {
        model: String,
        field: String,
        trigger: String,
        source: Box<DenormError>,
    },

    // ============ Reconciliation Errors ============
    /// Dirty queue did not drain within the configured number of passes
    FlushPassesExceeded {
        max_passes: usize,
        remaining: usize,
    },

    /// Persisting a recomputed instance failed
    SaveFailed {
        model: String,
        pk: String,
        reason: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// Serialization/deserialization failed
    SerializationError {
        message: String,
    },

    /// Internal error (bug in this crate)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl DenormError {
    /// SQLSTATE-style code for this error
    pub fn sqlstate(&self) -> &'static str {
        use DenormError::*;
        match self {
            UnsupportedSubject { .. } => "42809", // Wrong object type
            EmptyFieldChange { .. } => "42P17", // Invalid object definition
            InvalidIdentifier { .. } => "42602", // Invalid name
            ModelNotFound { .. } => "42P01", // Undefined table
            FieldNotFound { .. } => "42703", // Undefined column
            RelationNotFound { .. } => "42830", // Invalid foreign key
            AmbiguousRelation { .. } => "42702", // Ambiguous column
            ConfigError { .. } => "22023", // Invalid parameter value

            NotSetUp { .. } => "55000", // Object not in prerequisite state
            AlreadySetUp { .. } => "55006", // Object in use
            SwappedModel { .. } => "42P16", // Invalid table definition
            DuplicateRegistration { .. } => "42710", // Duplicate object

            UnsupportedFragment { .. } => "0A000", // Feature not supported
            ParameterMismatch { .. } => "08P01", // Protocol violation

            Database { .. } => "58000", // System error
            InstallFailed { .. } => "58030", // I/O error
            FlushPassesExceeded { .. } => "54001", // Statement too complex
            SaveFailed { .. } => "P0001", // Raise exception

            SerializationError { .. } => "22P02",
            InternalError { .. } => "XX000",
        }
    }

    /// Driver-reported code of the underlying database error, if any
    pub fn database_code(&self) -> Option<&str> {
        match self {
            DenormError::Database { code, .. } => code.as_deref(),
            DenormError::InstallFailed { source, .. } => source.database_code(),
            _ => None,
        }
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        DenormError::InternalError { message, file, line }
    }

    /// Shorthand for a database error raised while running `operation`
    pub fn database(operation: impl Into<String>, code: Option<String>, message: impl Into<String>) -> Self {
        DenormError::Database {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DenormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DenormError::*;
        match self {
            UnsupportedSubject { description } => {
                write!(f, "Unsupported trigger subject: {}", description)
            }
            EmptyFieldChange { table } => {
                write!(f, "Field-change condition on '{}' has no fields", table)
            }
            InvalidIdentifier { identifier, reason } => {
                write!(f, "Invalid identifier '{}': {}", identifier, reason)
            }
            ModelNotFound { model } => {
                write!(f, "Model '{}' is not known", model)
            }
            FieldNotFound { model, field } => {
                write!(f, "Model '{}' has no field '{}'", model, field)
            }
            RelationNotFound { from, to } => {
                write!(f, "No relation between '{}' and '{}'", from, to)
            }
            AmbiguousRelation { from, to, candidates } => {
                write!(
                    f,
                    "Relation between '{}' and '{}' is ambiguous (candidates: {})",
                    from,
                    to,
                    candidates.join(", ")
                )
            }
            ConfigError { setting, value, reason } => {
                write!(f, "Configuration error for '{}': {} (value: {})", setting, reason, value)
            }
            NotSetUp { model, field } => {
                write!(f, "Denorm {}.{} used before setup()", model, field)
            }
            AlreadySetUp { model, field } => {
                write!(f, "Denorm {}.{} is already set up", model, field)
            }
            SwappedModel { model } => {
                write!(f, "Model '{}' is swapped and cannot own denormalized fields", model)
            }
            DuplicateRegistration { model, field } => {
                write!(f, "A denorm for {}.{} is already registered", model, field)
            }
            UnsupportedFragment { fragment, dialect } => {
                write!(f, "{} cannot be rendered for the {} dialect", fragment, dialect)
            }
            ParameterMismatch { placeholders, params } => {
                write!(f, "Statement has {} placeholders but {} parameters", placeholders, params)
            }
            Database { operation, code, message } => match code {
                Some(code) => write!(f, "Database error during '{}' [{}]: {}", operation, code, message),
                None => write!(f, "Database error during '{}': {}", operation, message),
            },
            InstallFailed { model, field, trigger, source } => {
                write!(
                    f,
                    "Installing trigger '{}' for {}.{} failed: {}",
                    trigger, model, field, source
                )
            }
            FlushPassesExceeded { max_passes, remaining } => {
                write!(
                    f,
                    "Dirty queue not drained after {} passes ({} markers remaining). \
                     Possible dependency cycle between denormalized fields.",
                    max_passes, remaining
                )
            }
            SaveFailed { model, pk, reason } => {
                write!(f, "Failed to save {}[{}]: {}", model, pk, reason)
            }
            SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for DenormError {}

/// Result type for denorm operations
pub type DenormResult<T> = Result<T, DenormError>;

/// Convert serde_json::Error to DenormError
impl From<serde_json::Error> for DenormError {
    fn from(e: serde_json::Error) -> Self {
        DenormError::SerializationError {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Convert regex::Error to DenormError
impl From<regex::Error> for DenormError {
    fn from(e: regex::Error) -> Self {
        DenormError::internal(format!("Regex compilation failed: {}", e), file!(), line!())
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::DenormError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::DenormError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}
