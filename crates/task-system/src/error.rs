use std::{error::Error, fmt};

use thiserror::Error;

use super::task::{Task, TaskId};

/// Task system's error type definition, representing when internal errors occurs.
#[derive(Debug, Error)]
pub enum SystemError {
	#[error("task panicked <id='{0}'>")]
	TaskPanic(TaskId),
	#[error("task result channel closed before completion <id='{0}'>")]
	ResultChannelClosed(TaskId),
}

/// Trait for errors that can be returned by tasks, we use this trait as a bound for the task system generic
/// error type.
///
/// With this trait, we can have a unified error type through all the tasks in the system.
pub trait RunError: Error + fmt::Debug + Send + Sync + 'static {}

/// We provide a blanket implementation for all types that also implements
/// [`std::error::Error`] and [`std::fmt::Debug`].
/// This will be automatically implemented for any type that implements `thiserror::Error`.
impl<T: Error + fmt::Debug + Send + Sync + 'static> RunError for T {}

/// A task system dispatcher error type, returning tasks when the task system has shutdown.
#[derive(Debug, Error)]
#[error("task system already shutdown and can't dispatch more tasks: <tasks_count={}>", .0.len())]
pub struct DispatcherShutdownError<E: RunError>(pub Vec<Box<dyn Task<E>>>);
