//! Error types for startup and for runtime capacity failures.

use crate::fiber_pool::MAX_FIBERS;
use crate::job::Job;
use crate::queue::JobPriority;

/// Why [`JobSystem::run`](crate::JobSystem::run) refused to start.
///
/// These are configuration or platform failures detected before the scheduler
/// goes live. None of them is retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("job system has already been started")]
    AlreadyInitialized,

    #[error("affinity requested for {threads} threads but only {cores} cores exist")]
    ThreadAffinity { threads: usize, cores: usize },

    #[error("invalid fiber count {0} (allowed 1..={max})", max = MAX_FIBERS)]
    InvalidNumFibers(usize),

    #[error("main callback is null")]
    NullCallback,

    #[error("OS call failed: {0}")]
    OsError(#[from] std::io::Error),

    #[error("{0}")]
    Unknown(String),
}

impl RunError {
    pub fn code(&self) -> ReturnCode {
        match self {
            RunError::AlreadyInitialized => ReturnCode::AlreadyInitialized,
            RunError::ThreadAffinity { .. } => ReturnCode::ErrorThreadAffinity,
            RunError::InvalidNumFibers(_) => ReturnCode::InvalidNumFibers,
            RunError::NullCallback => ReturnCode::NullCallback,
            RunError::OsError(_) => ReturnCode::OsError,
            RunError::Unknown(_) => ReturnCode::UnknownError,
        }
    }
}

/// Numeric form of a `run` outcome, as handed across the C API.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Success = 0,
    UnknownError,
    OsError,
    NullCallback,
    AlreadyInitialized,
    InvalidNumFibers,
    ErrorThreadAffinity,
}

impl From<&Result<(), RunError>> for ReturnCode {
    fn from(result: &Result<(), RunError>) -> Self {
        match result {
            Ok(()) => ReturnCode::Success,
            Err(err) => err.code(),
        }
    }
}

/// Runtime failures reported to whoever submitted or waited.
///
/// Variants that carry a [`Job`] hand it back so the caller can retry later.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{priority:?} priority queue is full")]
    QueueFull { priority: JobPriority, job: Job },

    #[error("job system is shutting down")]
    ShuttingDown { job: Job },

    #[error("all {0} waiter slots of the counter are occupied")]
    WaiterSlotsFull(usize),

    #[error("closure of {size} bytes (align {align}) does not fit in a {capacity} byte job")]
    ClosureTooLarge {
        size: usize,
        align: usize,
        capacity: usize,
    },
}

impl JobError {
    /// Takes back the rejected job, if this error carries one.
    pub fn into_job(self) -> Option<Job> {
        match self {
            JobError::QueueFull { job, .. } | JobError::ShuttingDown { job } => Some(job),
            _ => None,
        }
    }
}

/// Failure to load a [`SchedulerConfig`](crate::SchedulerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes() {
        assert_eq!(ReturnCode::from(&Ok(())), ReturnCode::Success);
        assert_eq!(ReturnCode::Success as u8, 0);
        assert_eq!(
            RunError::ThreadAffinity {
                threads: 8,
                cores: 4
            }
            .code(),
            ReturnCode::ErrorThreadAffinity
        );
        assert_eq!(
            ReturnCode::from(&Err(RunError::NullCallback)),
            ReturnCode::NullCallback
        );
    }

    #[test]
    fn test_into_job_returns_rejected_job() {
        let err = JobError::QueueFull {
            priority: JobPriority::Low,
            job: Job::new(|| {}),
        };
        assert!(err.to_string().contains("Low"));
        assert!(err.into_job().is_some());
        assert!(JobError::WaiterSlotsFull(16).into_job().is_none());
    }
}
