//! Failures raised by the composer itself.

use std::any::Any;

/// The error type for failures that originate inside the dispatch machinery.
///
/// Errors returned by your middleware are never converted into this type.
/// They flow through the chain untouched as your own `E`. `Error` only
/// surfaces problems the composer detects, which is why every composed
/// stack requires `E: From<Error>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A continuation ran for an index the chain has already reached.
    ///
    /// Either the same `next` was run twice, or an earlier `next` was run
    /// after a later one. This always points at a bug in a middleware.
    #[error("next() called multiple times (stack index {index})")]
    NextCalledMultipleTimes { index: usize },

    /// The chain was exhausted under [`Exhausted::Fail`](crate::Exhausted::Fail).
    #[error("no middleware or final continuation at stack index {index}")]
    NoContinuation { index: usize },

    /// A middleware panicked while building or polling its future.
    #[error("middleware panicked: {0}")]
    Panicked(String),
}

impl Error {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_keep_their_message() {
        assert_eq!(
            Error::from_panic(Box::new("boom")),
            Error::Panicked("boom".into())
        );
        assert_eq!(
            Error::from_panic(Box::new(String::from("owned boom"))),
            Error::Panicked("owned boom".into())
        );
        assert_eq!(
            Error::from_panic(Box::new(42_u32)),
            Error::Panicked("non-string panic payload".into())
        );
    }

    #[test]
    fn display_names_the_index() {
        let err = Error::NextCalledMultipleTimes { index: 3 };
        assert_eq!(err.to_string(), "next() called multiple times (stack index 3)");
    }
}
