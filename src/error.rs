use std::fmt;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// An operation was attempted in a state that forbids it. Always a
    /// programming error on the caller's side.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The task ended up canceled. Not a failure.
    #[error("task canceled")]
    Canceled,

    /// The work body raised an error (or panicked). The underlying error is
    /// shared so every waiter and callback observes the same failure.
    #[error("task failed: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),

    #[error("timed out waiting for task")]
    Timeout,

    /// The queue no longer admits tasks.
    #[error("queue is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(err))
    }

    pub fn failed_msg<S: Into<String>>(msg: S) -> Self {
        Error::Failed(Arc::new(Message(msg.into())))
    }

    pub(crate) fn panicked(message: String) -> Self {
        Error::Failed(Arc::new(PanicError { message }))
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

#[derive(Debug)]
struct PanicError {
    message: String,
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task panicked: {}", self.message)
    }
}

impl std::error::Error for PanicError {}
