use std::{
	num::NonZeroUsize,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use async_channel as chan;
use futures_concurrency::future::Join;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, trace, warn};

use super::{
	error::{DispatcherShutdownError, RunError},
	task::{IntoTask, Task, TaskHandle, TaskPriority, TaskWorkState},
	worker::{Lanes, WorkerBuilder},
};

/// The task system is the main entry point for dispatching tasks. It owns a fixed amount of
/// workers that drain two lanes, [`TaskPriority::High`] first.
pub struct System<E: RunError> {
	high_tx: chan::Sender<TaskWorkState<E>>,
	normal_tx: chan::Sender<TaskWorkState<E>>,
	shutting_down: Arc<AtomicBool>,
	workers: Vec<JoinHandle<()>>,
}

impl<E: RunError> System<E> {
	/// Spawns `workers_count` workers on the current tokio runtime.
	#[must_use]
	pub fn new(workers_count: NonZeroUsize) -> Self {
		let (high_tx, high_rx) = chan::unbounded();
		let (normal_tx, normal_rx) = chan::unbounded();
		let shutting_down = Arc::new(AtomicBool::new(false));

		let lanes = Lanes {
			high: high_rx,
			normal: normal_rx,
		};

		let workers = (0..workers_count.get())
			.map(|id| WorkerBuilder::new(id, lanes.clone(), Arc::clone(&shutting_down)).build())
			.collect();

		trace!(workers_count = workers_count.get(), "Task system started");

		Self {
			high_tx,
			normal_tx,
			shutting_down,
			workers,
		}
	}

	/// One worker per available core.
	#[must_use]
	pub fn with_available_parallelism() -> Self {
		let workers_count = std::thread::available_parallelism().unwrap_or_else(|e| {
			error!(?e, "Failed to get available parallelism in the task system");
			NonZeroUsize::MIN
		});

		Self::new(workers_count)
	}

	/// Amount of workers in this system.
	#[must_use]
	pub fn workers_count(&self) -> usize {
		self.workers.len()
	}

	/// Dispatches a task to the system, the task will be enqueued on the lane given by
	/// [`Task::priority`].
	pub async fn dispatch(
		&self,
		into_task: impl IntoTask<E>,
	) -> Result<TaskHandle<E>, DispatcherShutdownError<E>> {
		self.enqueue(into_task.into_task()).await
	}

	/// Dispatches many tasks at once. High priority tasks are enqueued before the normal ones, so a
	/// single worker always sees all of them first.
	pub async fn dispatch_many(
		&self,
		into_tasks: impl IntoIterator<Item = impl IntoTask<E>> + Send,
	) -> Result<Vec<TaskHandle<E>>, DispatcherShutdownError<E>> {
		let (high, normal) = into_tasks
			.into_iter()
			.map(IntoTask::into_task)
			.partition::<Vec<_>, _>(|task| task.priority() == TaskPriority::High);

		let mut handles = Vec::with_capacity(high.len() + normal.len());
		let mut pending = high.into_iter().chain(normal);

		while let Some(task) = pending.next() {
			match self.enqueue(task).await {
				Ok(handle) => handles.push(handle),
				Err(DispatcherShutdownError(mut tasks)) => {
					tasks.extend(pending);
					return Err(DispatcherShutdownError(tasks));
				}
			}
		}

		Ok(handles)
	}

	async fn enqueue(
		&self,
		task: Box<dyn Task<E>>,
	) -> Result<TaskHandle<E>, DispatcherShutdownError<E>> {
		if self.shutting_down.load(Ordering::Acquire) {
			return Err(DispatcherShutdownError(vec![task]));
		}

		let task_id = task.id();
		let lane = match task.priority() {
			TaskPriority::High => &self.high_tx,
			TaskPriority::Normal => &self.normal_tx,
		};

		let (done_tx, done_rx) = oneshot::channel();

		lane.send(TaskWorkState { task, done_tx })
			.await
			.map_err(|chan::SendError(TaskWorkState { task, .. })| {
				DispatcherShutdownError(vec![task])
			})?;

		trace!(%task_id, "Task dispatched");

		Ok(TaskHandle { task_id, done_rx })
	}

	/// Closes both lanes and waits for the workers to run every task already enqueued.
	pub async fn drain(self) {
		self.high_tx.close();
		self.normal_tx.close();

		self.join_workers().await;
	}

	/// Closes both lanes and stops the workers, tasks that didn't start yet are handed back
	/// through their handles as [`TaskStatus::Shutdown`](crate::TaskStatus::Shutdown).
	pub async fn shutdown(self) {
		self.shutting_down.store(true, Ordering::Release);
		self.high_tx.close();
		self.normal_tx.close();

		self.join_workers().await;
	}

	async fn join_workers(self) {
		if self
			.workers
			.into_iter()
			.collect::<Vec<_>>()
			.join()
			.await
			.into_iter()
			.filter_map(Result::err)
			.map(|e| error!(?e, "Worker failed to join"))
			.count() > 0
		{
			warn!("Some task system workers didn't finish cleanly");
		}
	}
}
