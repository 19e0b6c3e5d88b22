//!
//! # Task System
//!
//! A small pool of async workers draining two priority lanes.
//!
//! Bring your own unified error type and dispatch some tasks, the system handles enqueueing,
//! parallel execution and error reporting:
//! - A fixed amount of workers, all pulling from the same shared lanes;
//! - Tasks on the high lane are always taken before tasks on the normal lane;
//! - Per task timeouts, and panics are reported instead of tearing down the worker;
//! - Draining the system waits for every enqueued task, while shutting it down hands
//!   pending tasks back to their dispatchers.
//!
//! ## Basic example
//!
//! ```
//! use std::num::NonZeroUsize;
//!
//! use formsync_task_system::{Task, TaskId, TaskOutput, TaskStatus, TaskSystem};
//! use async_trait::async_trait;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum SampleError {
//!     #[error("Sample error")]
//!     SampleError,
//! }
//!
//! #[derive(Debug)]
//! pub struct ReadyTask {
//!     id: TaskId,
//! }
//!
//! #[async_trait]
//! impl Task<SampleError> for ReadyTask {
//!     fn id(&self) -> TaskId {
//!         self.id
//!     }
//!
//!     async fn run(&mut self) -> Result<TaskOutput, SampleError> {
//!         Ok(TaskOutput::Empty)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let system = TaskSystem::new(NonZeroUsize::new(2).unwrap());
//!
//!     let handle = system.dispatch(ReadyTask { id: TaskId::new_v4() }).await.unwrap();
//!
//!     system.drain().await;
//!
//!     assert!(matches!(
//!         handle.await,
//!         Ok(TaskStatus::Done((_, TaskOutput::Empty)))
//!     ));
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod error;
mod system;
mod task;
mod worker;

pub use error::{DispatcherShutdownError, RunError, SystemError as TaskSystemError};
pub use system::System as TaskSystem;
pub use task::{
	AnyTaskOutput, IntoAnyTaskOutput, IntoTask, Task, TaskHandle, TaskId, TaskOutput,
	TaskPriority, TaskStatus,
};
