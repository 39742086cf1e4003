use thiserror::Error;
use tilefuse::ir::VerifyError;

/// Failures of kernel generation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmitError {
    /// The fusion/configuration pair cannot be expressed as a kernel. Callers
    /// such as an autotuner skip the configuration.
    #[error("uncompilable: {0}")]
    Uncompilable(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A broken invariant of the input or of the emitter itself.
    #[error("internal: {0}")]
    Internal(String),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl EmitError {
    pub fn uncompilable(message: impl Into<String>) -> Self {
        EmitError::Uncompilable(message.into())
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        EmitError::ResourceExhausted(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        EmitError::Unsupported(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EmitError::Internal(message.into())
    }

    pub fn is_uncompilable(&self) -> bool {
        matches!(self, EmitError::Uncompilable(_))
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, EmitError::ResourceExhausted(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, EmitError::Internal(_) | EmitError::Verify(_))
    }
}

pub type EmitResult<T> = Result<T, EmitError>;

/// Returns an [`EmitError::Internal`] naming the failed condition when it does not hold.
#[macro_export]
macro_rules! ret_check {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::EmitError::Internal(format!(
                "check failed: {}",
                stringify!($cond)
            )));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::EmitError::Internal(format!(
                "check failed: {}: {}",
                stringify!($cond),
                format!($($arg)+)
            )));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(value: i64) -> EmitResult<i64> {
        ret_check!(value > 0, "value was {value}");
        Ok(value)
    }

    #[test]
    fn ret_check_reports_the_condition() {
        assert_eq!(checked(3), Ok(3));
        let err = checked(-1).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "internal: check failed: value > 0: value was -1");
    }

    #[test]
    fn verify_errors_count_as_internal() {
        let err: EmitError = VerifyError::structure("tt.dot", "bad").into();
        assert!(err.is_internal());
        assert!(!err.is_uncompilable());
    }
}
