use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reasons a session pump stops. Every variant is terminal for the session;
/// nothing is retried.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("message of {len} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { len: usize, limit: usize },

    #[error("no pong received before the read deadline")]
    ReadDeadline,

    #[error("write did not complete before the write deadline")]
    WriteDeadline,

    #[error("hub is no longer running")]
    HubClosed,
}

impl SessionError {
    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Transport(err.into())
    }
}
