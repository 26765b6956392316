use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Schema,
    Table,
    Column,
    Index,
    Job,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Schema => write!(f, "schema"),
            ResourceType::Table => write!(f, "table"),
            ResourceType::Column => write!(f, "column"),
            ResourceType::Index => write!(f, "index"),
            ResourceType::Job => write!(f, "job"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShiftErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    Corruption,
    Conflict,
    OwnershipLost,
    Timeout,
    SchemaAlreadyExists,
    TableAlreadyExists,
    ColumnAlreadyExists,
    IndexAlreadyExists,
    SchemaNotFound,
    TableNotFound,
    ColumnNotFound,
    IndexNotFound,
    JobNotFound,
    PrimaryCantHaveNull,
    UnsupportedModifyColumn,
    CannotCancel,
    JobAlreadyFinished,
    DataTruncated,
    DataOutOfRange,
    TruncatedWrongValue,
    DataTooLong,
    DuplicateEntry,
    BadNull,
    SchemaChanged,
    SessionBusy,
    JobCancelled,
    ErrorCountLimit,
    Interrupted,
    Panic,
}

impl ShiftErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ShiftErrorCode::Io => "io",
            ShiftErrorCode::Encode => "encode",
            ShiftErrorCode::Decode => "decode",
            ShiftErrorCode::Validation => "validation",
            ShiftErrorCode::InvalidConfig => "invalid_config",
            ShiftErrorCode::Corruption => "corruption",
            ShiftErrorCode::Conflict => "conflict",
            ShiftErrorCode::OwnershipLost => "ownership_lost",
            ShiftErrorCode::Timeout => "timeout",
            ShiftErrorCode::SchemaAlreadyExists => "schema_already_exists",
            ShiftErrorCode::TableAlreadyExists => "table_already_exists",
            ShiftErrorCode::ColumnAlreadyExists => "column_already_exists",
            ShiftErrorCode::IndexAlreadyExists => "index_already_exists",
            ShiftErrorCode::SchemaNotFound => "schema_not_found",
            ShiftErrorCode::TableNotFound => "table_not_found",
            ShiftErrorCode::ColumnNotFound => "column_not_found",
            ShiftErrorCode::IndexNotFound => "index_not_found",
            ShiftErrorCode::JobNotFound => "job_not_found",
            ShiftErrorCode::PrimaryCantHaveNull => "primary_cant_have_null",
            ShiftErrorCode::UnsupportedModifyColumn => "unsupported_modify_column",
            ShiftErrorCode::CannotCancel => "cannot_cancel",
            ShiftErrorCode::JobAlreadyFinished => "job_already_finished",
            ShiftErrorCode::DataTruncated => "data_truncated",
            ShiftErrorCode::DataOutOfRange => "data_out_of_range",
            ShiftErrorCode::TruncatedWrongValue => "truncated_wrong_value",
            ShiftErrorCode::DataTooLong => "data_too_long",
            ShiftErrorCode::DuplicateEntry => "duplicate_entry",
            ShiftErrorCode::BadNull => "bad_null",
            ShiftErrorCode::SchemaChanged => "schema_changed",
            ShiftErrorCode::SessionBusy => "session_busy",
            ShiftErrorCode::JobCancelled => "job_cancelled",
            ShiftErrorCode::ErrorCountLimit => "error_count_limit",
            ShiftErrorCode::Interrupted => "interrupted",
            ShiftErrorCode::Panic => "panic",
        }
    }
}

/// Persisted form of a job failure. Lives on the job record and in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ShiftErrorCode,
    pub message: String,
}

impl JobError {
    pub fn from_error(err: &ShiftError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn into_error(self, job_id: i64) -> ShiftError {
        match self.code {
            ShiftErrorCode::JobCancelled => ShiftError::JobCancelled { job_id },
            code => ShiftError::JobFailed {
                job_id,
                code,
                message: self.message,
            },
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("corruption: {message}")]
    Corruption { message: String },
    #[error("write conflict on key {key}")]
    Conflict { key: String },
    #[error("ddl ownership lost")]
    OwnershipLost,
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("All parts of a PRIMARY KEY must be NOT NULL; column '{column}' cannot become nullable")]
    PrimaryCantHaveNull { column: String },
    #[error("unsupported modify column: {reason}")]
    UnsupportedModifyColumn { reason: String },
    #[error("job {job_id} cannot be cancelled: {reason}")]
    CannotCancel { job_id: i64, reason: String },
    #[error("job {job_id} has already finished")]
    JobAlreadyFinished { job_id: i64 },
    #[error("Data truncated for column '{column}' at row {row}")]
    DataTruncated { column: String, row: i64 },
    #[error("Out of range value for column '{column}' at row {row}")]
    DataOutOfRange { column: String, row: i64 },
    #[error("Incorrect {type_name} value: '{value}' for column '{column}' at row {row}")]
    TruncatedWrongValue {
        type_name: String,
        value: String,
        column: String,
        row: i64,
    },
    #[error("Data too long for column '{column}' at row {row}")]
    DataTooLong { column: String, row: i64 },
    #[error("Duplicate entry '{entry}' for key '{index}'")]
    DuplicateEntry { index: String, entry: String },
    #[error("Column '{column}' cannot be null")]
    BadNull { column: String },
    #[error("schema of table '{table}' changed during transaction")]
    SchemaChanged { table: String },
    #[error("session is inside an active transaction")]
    SessionBusy,
    #[error("job {job_id} was cancelled")]
    JobCancelled { job_id: i64 },
    #[error("job {job_id} failed: {message}")]
    JobFailed {
        job_id: i64,
        code: ShiftErrorCode,
        message: String,
    },
    #[error("{reason} and error count beyond the limitation {limit}, cancelled")]
    ErrorCountLimit { limit: u64, reason: String },
    #[error("step interrupted: {0}")]
    Interrupted(String),
    #[error("panic in handling DDL logic: {0}")]
    Panic(String),
}

impl ShiftError {
    pub fn code(&self) -> ShiftErrorCode {
        match self {
            ShiftError::Io(_) => ShiftErrorCode::Io,
            ShiftError::Encode(_) => ShiftErrorCode::Encode,
            ShiftError::Decode(_) => ShiftErrorCode::Decode,
            ShiftError::Validation(_) => ShiftErrorCode::Validation,
            ShiftError::InvalidConfig { .. } => ShiftErrorCode::InvalidConfig,
            ShiftError::Corruption { .. } => ShiftErrorCode::Corruption,
            ShiftError::Conflict { .. } => ShiftErrorCode::Conflict,
            ShiftError::OwnershipLost => ShiftErrorCode::OwnershipLost,
            ShiftError::Timeout(_) => ShiftErrorCode::Timeout,
            ShiftError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Schema => ShiftErrorCode::SchemaAlreadyExists,
                ResourceType::Table => ShiftErrorCode::TableAlreadyExists,
                ResourceType::Column => ShiftErrorCode::ColumnAlreadyExists,
                ResourceType::Index => ShiftErrorCode::IndexAlreadyExists,
                ResourceType::Job => ShiftErrorCode::Validation,
            },
            ShiftError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Schema => ShiftErrorCode::SchemaNotFound,
                ResourceType::Table => ShiftErrorCode::TableNotFound,
                ResourceType::Column => ShiftErrorCode::ColumnNotFound,
                ResourceType::Index => ShiftErrorCode::IndexNotFound,
                ResourceType::Job => ShiftErrorCode::JobNotFound,
            },
            ShiftError::PrimaryCantHaveNull { .. } => ShiftErrorCode::PrimaryCantHaveNull,
            ShiftError::UnsupportedModifyColumn { .. } => ShiftErrorCode::UnsupportedModifyColumn,
            ShiftError::CannotCancel { .. } => ShiftErrorCode::CannotCancel,
            ShiftError::JobAlreadyFinished { .. } => ShiftErrorCode::JobAlreadyFinished,
            ShiftError::DataTruncated { .. } => ShiftErrorCode::DataTruncated,
            ShiftError::DataOutOfRange { .. } => ShiftErrorCode::DataOutOfRange,
            ShiftError::TruncatedWrongValue { .. } => ShiftErrorCode::TruncatedWrongValue,
            ShiftError::DataTooLong { .. } => ShiftErrorCode::DataTooLong,
            ShiftError::DuplicateEntry { .. } => ShiftErrorCode::DuplicateEntry,
            ShiftError::BadNull { .. } => ShiftErrorCode::BadNull,
            ShiftError::SchemaChanged { .. } => ShiftErrorCode::SchemaChanged,
            ShiftError::SessionBusy => ShiftErrorCode::SessionBusy,
            ShiftError::JobCancelled { .. } => ShiftErrorCode::JobCancelled,
            ShiftError::JobFailed { code, .. } => *code,
            ShiftError::ErrorCountLimit { .. } => ShiftErrorCode::ErrorCountLimit,
            ShiftError::Interrupted(_) => ShiftErrorCode::Interrupted,
            ShiftError::Panic(_) => ShiftErrorCode::Panic,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Transient failures that a bounded retry may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShiftError::Conflict { .. } | ShiftError::Timeout(_) | ShiftError::Io(_)
        )
    }

    /// Failures caused by existing row data that no retry can fix.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self.code(),
            ShiftErrorCode::DataTruncated
                | ShiftErrorCode::DataOutOfRange
                | ShiftErrorCode::TruncatedWrongValue
                | ShiftErrorCode::DataTooLong
                | ShiftErrorCode::DuplicateEntry
        )
    }

    /// Errors rejected before the job mutates any metadata.
    pub fn is_constraint_error(&self) -> bool {
        matches!(
            self.code(),
            ShiftErrorCode::PrimaryCantHaveNull
                | ShiftErrorCode::UnsupportedModifyColumn
                | ShiftErrorCode::ColumnAlreadyExists
                | ShiftErrorCode::IndexAlreadyExists
                | ShiftErrorCode::TableAlreadyExists
                | ShiftErrorCode::SchemaAlreadyExists
                | ShiftErrorCode::ColumnNotFound
                | ShiftErrorCode::IndexNotFound
                | ShiftErrorCode::TableNotFound
                | ShiftErrorCode::SchemaNotFound
                | ShiftErrorCode::Validation
        )
    }

    pub(crate) fn conflict(key: &[u8]) -> Self {
        ShiftError::Conflict {
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }
}

pub(crate) fn encode_err(e: impl std::fmt::Display) -> ShiftError {
    ShiftError::Encode(e.to_string())
}

pub(crate) fn decode_err(e: impl std::fmt::Display) -> ShiftError {
    ShiftError::Decode(e.to_string())
}
