use thiserror::Error;

use crate::Value;

/// Failures that are visible to the calling language code.
///
/// Every call path returns these unchanged; a specialized thunk never wraps
/// or replaces an error raised by the method it dispatches to.
#[derive(Debug, Clone, Error)]
pub enum RaiseError {
    #[error("wrong number of arguments (given {given}, expected {expected})")]
    ArgumentError { given: usize, expected: String },
    #[error("undefined method `{name}' for {receiver}")]
    NoMethodError { name: String, receiver: String },
    #[error("private method `{name}' called for {receiver}")]
    PrivateMethodError { name: String, receiver: String },
    #[error("undefined local variable or method `{name}' for {receiver}")]
    NameError { name: String, receiver: String },
    #[error("{0}")]
    TypeError(String),
    #[error("no block given (yield)")]
    LocalJumpError,
    #[error("{0}")]
    Raised(Value),
}

pub type CallResult = Result<Value, RaiseError>;

impl RaiseError {
    pub fn argument_count(given: usize, expected: impl Into<String>) -> Self {
        Self::ArgumentError {
            given,
            expected: expected.into(),
        }
    }

    pub fn is_argument_error(&self) -> bool {
        matches!(self, Self::ArgumentError { .. })
    }
}

impl PartialEq for RaiseError {
    fn eq(&self, other: &Self) -> bool {
        // messages carry every distinguishing field
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.to_string() == other.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_error_message_matches_language_format() {
        let err = RaiseError::argument_count(1, "2..3");
        assert_eq!(
            err.to_string(),
            "wrong number of arguments (given 1, expected 2..3)"
        );
        assert!(err.is_argument_error());
    }

    #[test]
    fn errors_compare_by_kind_and_message() {
        let a = RaiseError::NoMethodError {
            name: "foo".into(),
            receiver: "an instance of A".into(),
        };
        let b = RaiseError::NameError {
            name: "foo".into(),
            receiver: "an instance of A".into(),
        };
        assert_ne!(a, b, "different kinds must not compare equal");
        assert_eq!(a.clone(), a);
    }
}
