use std::{error::Error, fmt, sync::Arc};

/// Reason handed to `cancel` / `abort`.
///
/// `Composite` carries one entry per tee branch, in branch order, when both
/// branches of a tee have been canceled.
#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    Message(String),
    Composite(Vec<Option<Reason>>),
}

impl From<&str> for Reason {
    fn from(s: &str) -> Self {
        Reason::Message(s.to_string())
    }
}

impl From<String> for Reason {
    fn from(s: String) -> Self {
        Reason::Message(s)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Message(msg) => write!(f, "{}", msg),
            Reason::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match part {
                        Some(reason) => write!(f, "{}", reason)?,
                        None => write!(f, "none")?,
                    }
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Stream operation was canceled")]
    Canceled,
    #[error("Stream was aborted{}", .0.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Aborted(Option<Reason>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream is locked")]
    Locked,
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    #[error("Invalid chunk size {0}: must be finite and non-negative")]
    InvalidSize(f64),
    #[error("Invalid high water mark {0}: must be non-negative")]
    InvalidHighWaterMark(f64),
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error(transparent)]
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct MessageError(String);

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(MessageError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(MessageError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use stream_engine::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn example() -> Result<(), StreamError> {
///     Err::<(), _>(ParseError)?;
///     Ok(())
/// }
/// assert!(example().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
