use std::error::Error;

/// Log the error of a result without consuming it.
pub trait LogError {
    fn log_error(&self, message: &str);
}

impl<T, E> LogError for Result<T, E>
where
    E: Error,
{
    fn log_error(&self, message: &str) {
        if let Err(e) = self {
            tracing::error!("{}: {}", message, e);
        }
    }
}
