use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::parse::{CodeRange, Diagnostic};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Error categories raised while compiling or running a script.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g., `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    SyntaxError,
    /// Source uses a construct outside the supported language subset.
    CompileError,
    TypeError,
    ValueError,
    NameError,
    AttributeError,
    IndexError,
    KeyError,
    ZeroDivisionError,
    /// The frame-depth guard tripped. Recoverable: the session errors, the
    /// host stays healthy.
    RecursionError,
}

/// An error raised during bytecode execution, before source spans are known.
///
/// The VM run loop attaches the failing instruction's span to any error that
/// reaches it without one, then converts to the public [`Exception`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunError {
    pub exc: ExcType,
    pub message: String,
    pub span: Option<CodeRange>,
}

impl RunError {
    pub(crate) fn new(exc: ExcType, message: impl Into<String>) -> Self {
        Self {
            exc,
            message: message.into(),
            span: None,
        }
    }

    pub(crate) fn with_span(mut self, span: CodeRange) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
        }
        self
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    pub(crate) fn type_error_arg_count(name: &str, expected: usize, actual: usize) -> Self {
        let plural = if expected == 1 { "" } else { "s" };
        Self::type_error(format!(
            "{name}() takes {expected} positional argument{plural} but {actual} were given"
        ))
    }

    pub(crate) fn type_error_not_callable(type_name: &str) -> Self {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    pub(crate) fn type_error_binary(op: &str, left: &str, right: &str) -> Self {
        Self::type_error(format!("unsupported operand type(s) for {op}: '{left}' and '{right}'"))
    }

    pub(crate) fn type_error_compare(op: &str, left: &str, right: &str) -> Self {
        Self::type_error(format!(
            "'{op}' not supported between instances of '{left}' and '{right}'"
        ))
    }

    pub(crate) fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    pub(crate) fn name_error(name: &str) -> Self {
        Self::new(ExcType::NameError, format!("name '{name}' is not defined"))
    }

    pub(crate) fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::new(
            ExcType::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    pub(crate) fn index_error() -> Self {
        Self::new(ExcType::IndexError, "list index out of range")
    }

    pub(crate) fn key_error(key_repr: String) -> Self {
        Self::new(ExcType::KeyError, key_repr)
    }

    pub(crate) fn zero_division() -> Self {
        Self::new(ExcType::ZeroDivisionError, "integer division or modulo by zero")
    }

    pub(crate) fn recursion() -> Self {
        Self::new(ExcType::RecursionError, "maximum recursion depth exceeded")
    }
}

/// A compile-time or runtime failure with its formatted message and span.
///
/// Compile and runtime errors format identically: `Type: message` plus a
/// 1-based location when the span is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub exc: ExcType,
    pub message: String,
    pub span: Option<CodeRange>,
}

impl Exception {
    pub(crate) fn new(exc: ExcType, message: impl Into<String>, span: Option<CodeRange>) -> Self {
        Self {
            exc,
            message: message.into(),
            span,
        }
    }

    pub(crate) fn from_diagnostic(diagnostic: Diagnostic) -> Self {
        Self::new(ExcType::SyntaxError, diagnostic.message, Some(diagnostic.range))
    }
}

impl From<RunError> for Exception {
    fn from(e: RunError) -> Self {
        Self::new(e.exc, e.message, e.span)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exc, self.message)?;
        if let Some(span) = self.span {
            write!(f, " ({span})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::CodeLoc;

    #[test]
    fn exception_display_with_span() {
        let exc = Exception::new(
            ExcType::ZeroDivisionError,
            "integer division or modulo by zero",
            Some(CodeRange::new(CodeLoc::new(2, 4), CodeLoc::new(2, 10))),
        );
        assert_eq!(
            exc.to_string(),
            "ZeroDivisionError: integer division or modulo by zero (line 3, column 5)"
        );
    }

    #[test]
    fn with_span_keeps_existing() {
        let inner = CodeRange::new(CodeLoc::new(0, 0), CodeLoc::new(0, 1));
        let outer = CodeRange::new(CodeLoc::new(5, 0), CodeLoc::new(5, 1));
        let err = RunError::zero_division().with_span(inner).with_span(outer);
        assert_eq!(err.span, Some(inner));
    }
}
