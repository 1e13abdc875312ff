//! Error taxonomy for run execution.
//!
//! Almost every error here ends up as data: the Runner converts it into a
//! failed [`StepResult`](crate::result::StepResult) carrying the rendered
//! message. Only [`RunError::ResourceExhausted`] crosses the engine boundary.

use thiserror::Error;

use armada_workflow::DeviceId;

/// Step-level failure categories.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// A target source could not be resolved.
    #[error("target resolution failed: {0}")]
    TargetResolution(String),

    /// A per-device step that requires targets resolved none.
    #[error("service '{service}' requires targets but none were resolved")]
    NoTargets {
        /// The service name.
        service: String,
    },

    /// Results could not be persisted.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A device session failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The validator is misconfigured.
    #[error("validation error: {0}")]
    Validation(String),

    /// The job output could not be converted.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// The job failed.
    #[error(transparent)]
    Job(#[from] JobError),

    /// A pre- or post-processing expression failed.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// The run lineage was stopped.
    #[error("run aborted")]
    Aborted,

    /// A shared resource could not be provisioned. This is the only fatal
    /// condition and is returned to the caller as an `Err`.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Errors raised by jobs.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The service names a job that is not registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// A required parameter is missing or has the wrong type.
    #[error("missing or invalid parameter: {0}")]
    MissingParameter(String),

    /// The job ran without a device but needs one.
    #[error("job '{0}' requires a device")]
    DeviceRequired(String),

    /// The job reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// A device session failed inside the job.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A template or expression failed inside the job.
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl JobError {
    /// Creates a [`JobError::Failed`] from any message.
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

/// Errors raised by connection drivers and the connection cache.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// No driver is registered for the requested kind.
    #[error("no connection driver registered for kind '{0}'")]
    UnknownDriver(String),

    /// Opening a session failed.
    #[error("failed to open {kind} session to {device}: {message}")]
    Open {
        /// The device.
        device: DeviceId,
        /// The driver kind.
        kind: String,
        /// Driver message.
        message: String,
    },

    /// Opening a session took longer than the configured timeout.
    #[error("timed out opening session to {device} after {seconds:.1}s")]
    Timeout {
        /// The device.
        device: DeviceId,
        /// Timeout in seconds.
        seconds: f64,
    },

    /// The liveness probe failed.
    #[error("liveness probe failed: {0}")]
    Probe(String),

    /// A command failed on the device.
    #[error("command failed: {0}")]
    Invoke(String),

    /// Closing a session failed.
    #[error("failed to close session: {0}")]
    Close(String),

    /// Credentials could not be resolved.
    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The store rejected a write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The store is unreachable or failed.
    #[error("persistence backend error: {0}")]
    Backend(String),
}

/// Errors raised by the restricted expression evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// The source text is not a valid expression.
    #[error("syntax error at {position}: {message}")]
    Syntax {
        /// Byte offset into the source.
        position: usize,
        /// What went wrong.
        message: String,
    },

    /// The expression names a variable outside the scope.
    #[error("variable '{0}' is not defined")]
    VariableNotFound(String),

    /// The expression calls a function outside the function table.
    #[error("function '{0}' is not available")]
    FunctionNotFound(String),

    /// An object has no such key.
    #[error("key '{0}' not found")]
    KeyNotFound(String),

    /// A list index is out of range.
    #[error("index {0} out of range")]
    IndexOutOfRange(i64),

    /// An operation was applied to values of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// A function was called with the wrong number of arguments.
    #[error("{function}() takes {expected} argument(s), got {got}")]
    Arity {
        /// The function name.
        function: &'static str,
        /// Accepted argument count, e.g. `"1"` or `"1 or 2"`.
        expected: &'static str,
        /// Provided argument count.
        got: usize,
    },

    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// The expression nests deeper than the configured limit.
    #[error("expression nesting exceeds depth limit of {0}")]
    TooDeep(usize),

    /// An assignment targets a function name.
    #[error("cannot assign to '{0}'")]
    ReadOnly(String),

    /// A string or list would grow past the evaluator's size ceiling.
    #[error("value would exceed {0} elements")]
    TooLarge(usize),

    /// Evaluation panicked; the panic was contained.
    #[error("evaluation panicked: {0}")]
    Panicked(String),
}

/// Errors raised by notification transports.
#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    /// No transport is registered for the channel.
    #[error("no notifier registered for channel '{0}'")]
    UnknownChannel(String),

    /// The notification has no destination and the transport needs one.
    #[error("notification to '{0}' has no destination")]
    MissingDestination(String),

    /// The transport failed.
    #[error("notification transport failed: {0}")]
    Transport(String),
}

/// Errors raised while loading engine configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// An environment override has an invalid value.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue {
        /// The environment variable.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A setting is out of range.
    #[error("{field} must be at least {min}")]
    OutOfRange {
        /// The setting.
        field: &'static str,
        /// Minimum accepted value.
        min: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_render_transparently() {
        let err = RunError::from(JobError::from(ConnectionError::Invoke("timeout".into())));
        assert_eq!(err.to_string(), "command failed: timeout");
    }

    #[test]
    fn arity_message() {
        let err = ExpressionError::Arity {
            function: "len",
            expected: "1",
            got: 2,
        };
        assert_eq!(err.to_string(), "len() takes 1 argument(s), got 2");
    }
}
