//! Error taxonomy for the engine.
//!
//! Every [`EngineError`] carries a stable, ascending numeric [`ErrorKind::code`]
//! grouped into four [`ErrorCategory`] ranges (user, internal, insufficient
//! resources, external), matching the propagation policy in the design doc:
//! user errors are returned to the client on next poll, insufficient-resource
//! errors cancel the query, internal errors cancel the task/stage (and the
//! query if retry is declined), external errors are tolerated within the
//! remote-task polling window.

use thiserror::Error;

/// The four error categories, in ascending code-range order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    User,
    Internal,
    InsufficientResources,
    External,
}

impl ErrorCategory {
    /// Base code for the category's range. Each category reserves a block of
    /// 65536 codes; within a category, codes are strictly sequential.
    const fn base(self) -> u32 {
        match self {
            ErrorCategory::User => 0x0000_0000,
            ErrorCategory::Internal => 0x0001_0000,
            ErrorCategory::InsufficientResources => 0x0002_0000,
            ErrorCategory::External => 0x0003_0000,
        }
    }
}

macro_rules! error_kinds {
    ($($category:ident => { $($variant:ident = $offset:expr),+ $(,)? }),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorKind {
            $($($variant),+,)+
        }

        impl ErrorKind {
            pub const fn category(self) -> ErrorCategory {
                match self {
                    $($(ErrorKind::$variant => ErrorCategory::$category),+,)+
                }
            }

            pub const fn code(self) -> u32 {
                match self {
                    $($(ErrorKind::$variant => ErrorCategory::$category.base() + $offset),+,)+
                }
            }

            /// All kinds in ascending code order, for the uniqueness/ordering property test.
            pub const ALL: &'static [ErrorKind] = &[
                $($(ErrorKind::$variant),+),+
            ];
        }
    };
}

error_kinds! {
    User => {
        SyntaxError = 0,
        SemanticError = 1,
        InvalidSessionProperty = 2,
        InvalidCastArgument = 3,
        InvalidFunctionArgument = 4,
        DivisionByZero = 5,
        NumericOverflow = 6,
        NotSupported = 7,
        PermissionDenied = 8,
        NotFound = 9,
        AlreadyExists = 10,
    },
    Internal => {
        InternalError = 0,
        RaptorError = 1,
        HiveCursorError = 2,
        HiveBadData = 3,
    },
    InsufficientResources => {
        ExceededMemoryLimit = 0,
        NoNodesAvailable = 1,
    },
    External => {
        TransactionConflict = 0,
        ExternalBatchAlreadyExists = 1,
        ConnectorError = 2,
    },
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single engine error: a stable kind/code, a human message, and an
/// optional cause chain.
#[derive(Debug, Error)]
#[error("{kind} ({code:#06x}): {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: ErrorKind,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    // Convenience constructors, one per kind used throughout the engine.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }
    pub fn invalid_session_property(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidSessionProperty, message)
    }
    pub fn invalid_cast_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCastArgument, message)
    }
    pub fn numeric_overflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NumericOverflow, message)
    }
    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "division by zero")
    }
    pub fn exceeded_memory_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExceededMemoryLimit, message)
    }
    pub fn no_nodes_available(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoNodesAvailable, message)
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
    pub fn raptor(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RaptorError, message)
    }
    pub fn transaction_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransactionConflict, message)
    }
    pub fn external_batch_already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalBatchAlreadyExists, message)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::with_cause(ErrorKind::InternalError, "serialization error", e)
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EngineError::new(ErrorKind::InternalError, format!("encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EngineError::new(ErrorKind::InternalError, format!("decode error: {e}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::with_cause(ErrorKind::InternalError, "io error", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Codes are unique, sequential within a category, and strictly
    /// increasing across categories; only the three category-start codes
    /// may be non-sequential with their predecessor.
    #[test]
    fn error_codes_are_unique_and_ordered() {
        let mut codes: Vec<u32> = ErrorKind::ALL.iter().map(|k| k.code()).collect();
        let original = codes.clone();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), original.len(), "error codes must be unique");
        assert_eq!(codes, original, "ErrorKind::ALL must already be in ascending order");

        let mut category_starts = 0;
        for window in codes.windows(2) {
            let (prev, next) = (window[0], window[1]);
            assert!(next > prev, "codes must strictly increase");
            if next != prev + 1 {
                category_starts += 1;
            }
        }
        // Exactly three gaps: Internal, InsufficientResources, External starts.
        assert_eq!(category_starts, 3);
    }

    #[test]
    fn category_boundaries_are_assigned_as_documented() {
        assert_eq!(ErrorKind::SyntaxError.code(), 0);
        assert_eq!(ErrorKind::InternalError.category(), ErrorCategory::Internal);
        assert_eq!(
            ErrorKind::ExceededMemoryLimit.category(),
            ErrorCategory::InsufficientResources
        );
        assert_eq!(ErrorKind::TransactionConflict.category(), ErrorCategory::External);
        assert!(ErrorKind::InternalError.code() > ErrorKind::AlreadyExists.code());
        assert!(ErrorKind::ExceededMemoryLimit.code() > ErrorKind::HiveBadData.code());
        assert!(ErrorKind::TransactionConflict.code() > ErrorKind::NoNodesAvailable.code());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = EngineError::not_found("table orders");
        let rendered = err.to_string();
        assert!(rendered.contains("NotFound"));
        assert!(rendered.contains("table orders"));
    }
}
