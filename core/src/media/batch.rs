use std::{collections::HashMap, num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use formsync_task_system::{
	DispatcherShutdownError, IntoAnyTaskOutput, Task, TaskId, TaskOutput, TaskPriority,
	TaskStatus, TaskSystem,
};
use tracing::{debug, instrument, warn};

use super::{ImageCategory, ImageError, ImageJob, ImageOutcome, ImagePipeline};

/// One image job on the worker pool.
pub struct ImageTask {
	id: TaskId,
	priority: TaskPriority,
	timeout: Duration,
	pipeline: Arc<ImagePipeline>,
	job: ImageJob,
}

impl ImageTask {
	#[must_use]
	pub fn new(
		pipeline: Arc<ImagePipeline>,
		job: ImageJob,
		priority: TaskPriority,
		timeout: Duration,
	) -> Self {
		Self {
			id: TaskId::new_v4(),
			priority,
			timeout,
			pipeline,
			job,
		}
	}
}

#[async_trait]
impl Task<ImageError> for ImageTask {
	fn id(&self) -> TaskId {
		self.id
	}

	fn priority(&self) -> TaskPriority {
		self.priority
	}

	fn with_timeout(&self) -> Option<Duration> {
		Some(self.timeout)
	}

	async fn run(&mut self) -> Result<TaskOutput, ImageError> {
		Ok(self.pipeline.process(&self.job).await.into_output())
	}
}

/// Runs every job on a pool of `workers`, waits for all of them and collects the outcomes by
/// record and column. Jobs that time out, panic or error are reported as
/// [`ImageOutcome::Failed`].
#[instrument(skip_all, fields(jobs = jobs.len(), workers = workers.get()))]
pub async fn run_batch(
	pipeline: Arc<ImagePipeline>,
	jobs: Vec<(ImageJob, TaskPriority)>,
	workers: NonZeroUsize,
	timeout: Duration,
) -> HashMap<(String, ImageCategory), ImageOutcome> {
	let mut outcomes = HashMap::with_capacity(jobs.len());
	if jobs.is_empty() {
		return outcomes;
	}

	let mut owners = HashMap::with_capacity(jobs.len());
	let tasks = jobs
		.into_iter()
		.map(|(job, priority)| {
			let task = ImageTask::new(Arc::clone(&pipeline), job, priority, timeout);
			owners.insert(task.id, (task.job.record_id.clone(), task.job.category));
			task
		})
		.collect::<Vec<_>>();

	let system = TaskSystem::<ImageError>::new(workers);

	let handles = match system.dispatch_many(tasks).await {
		Ok(handles) => handles,
		Err(DispatcherShutdownError(tasks)) => {
			warn!(count = tasks.len(), "Image pool refused jobs");
			for task in tasks {
				if let Some(owner) = owners.remove(&task.id()) {
					outcomes.insert(owner, ImageOutcome::Failed("image pool shut down".into()));
				}
			}
			Vec::new()
		}
	};

	system.drain().await;

	for handle in handles {
		let task_id = handle.task_id();
		let outcome = match handle.await {
			Ok(TaskStatus::Done((_, TaskOutput::Out(out)))) => out
				.downcast::<ImageOutcome>()
				.map_or_else(|_| ImageOutcome::Failed("unexpected task output".into()), |o| *o),
			Ok(TaskStatus::Done((_, TaskOutput::Empty))) => {
				ImageOutcome::Failed("task returned nothing".into())
			}
			Ok(TaskStatus::TimedOut(_)) => ImageOutcome::Failed(format!(
				"timed out after {}s",
				timeout.as_secs()
			)),
			Ok(TaskStatus::Error(e)) => ImageOutcome::Failed(e.to_string()),
			Ok(TaskStatus::Shutdown(_)) => ImageOutcome::Failed("image pool shut down".into()),
			Err(e) => ImageOutcome::Failed(e.to_string()),
		};

		if let ImageOutcome::Failed(reason) = &outcome {
			warn!(%task_id, %reason, "Image job failed");
		}

		if let Some(owner) = owners.remove(&task_id) {
			outcomes.insert(owner, outcome);
		}
	}

	debug!(collected = outcomes.len(), "Image batch finished");

	outcomes
}
