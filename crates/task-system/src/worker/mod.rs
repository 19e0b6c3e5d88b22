use std::{
	panic::AssertUnwindSafe,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use async_channel as chan;
use futures::FutureExt;
use tokio::{spawn, task::JoinHandle, time::timeout};
use tracing::{error, trace, warn};

use super::{
	error::{RunError, SystemError},
	task::{TaskStatus, TaskWorkState},
};

pub type WorkerId = usize;

/// Receiving side of both lanes, cloned into every worker.
pub(crate) struct Lanes<E: RunError> {
	pub(crate) high: chan::Receiver<TaskWorkState<E>>,
	pub(crate) normal: chan::Receiver<TaskWorkState<E>>,
}

impl<E: RunError> Clone for Lanes<E> {
	fn clone(&self) -> Self {
		Self {
			high: self.high.clone(),
			normal: self.normal.clone(),
		}
	}
}

impl<E: RunError> Lanes<E> {
	/// Next task to run, always preferring the high lane. Returns `None` once both lanes are
	/// closed and empty.
	async fn next(&self) -> Option<TaskWorkState<E>> {
		if let Ok(work) = self.high.try_recv() {
			return Some(work);
		}

		if let Ok(work) = self.normal.try_recv() {
			return Some(work);
		}

		tokio::select! {
			biased;

			Ok(work) = self.high.recv() => Some(work),
			Ok(work) = self.normal.recv() => Some(work),
			else => None,
		}
	}
}

pub(crate) struct WorkerBuilder<E: RunError> {
	id: WorkerId,
	lanes: Lanes<E>,
	shutting_down: Arc<AtomicBool>,
}

impl<E: RunError> WorkerBuilder<E> {
	pub(crate) const fn new(id: WorkerId, lanes: Lanes<E>, shutting_down: Arc<AtomicBool>) -> Self {
		Self {
			id,
			lanes,
			shutting_down,
		}
	}

	pub(crate) fn build(self) -> JoinHandle<()> {
		let Self {
			id,
			lanes,
			shutting_down,
		} = self;

		spawn(run(id, lanes, shutting_down))
	}
}

async fn run<E: RunError>(id: WorkerId, lanes: Lanes<E>, shutting_down: Arc<AtomicBool>) {
	trace!(worker_id = id, "Worker started");

	while let Some(TaskWorkState { mut task, done_tx }) = lanes.next().await {
		let task_id = task.id();

		if shutting_down.load(Ordering::Acquire) {
			trace!(worker_id = id, %task_id, "Handing task back due to shutdown");
			if done_tx.send(Ok(TaskStatus::Shutdown(task))).is_err() {
				warn!(%task_id, "Task handle dropped before receiving shutdown status");
			}
			continue;
		}

		let max_duration = task.with_timeout();
		let fut = AssertUnwindSafe(task.run()).catch_unwind();

		let status = match max_duration {
			Some(duration) => match timeout(duration, fut).await {
				Ok(res) => Some(res),
				Err(_elapsed) => None,
			},
			None => Some(fut.await),
		};

		let status = match status {
			Some(Ok(Ok(out))) => Ok(TaskStatus::Done((task_id, out))),
			Some(Ok(Err(e))) => Ok(TaskStatus::Error(e)),
			Some(Err(_panic)) => {
				error!(worker_id = id, %task_id, "Task panicked");
				Err(SystemError::TaskPanic(task_id))
			}
			None => {
				warn!(worker_id = id, %task_id, "Task timed out");
				Ok(TaskStatus::TimedOut(task_id))
			}
		};

		if done_tx.send(status).is_err() {
			trace!(worker_id = id, %task_id, "Task handle dropped before receiving its status");
		}
	}

	trace!(worker_id = id, "Worker finished, lanes closed");
}
