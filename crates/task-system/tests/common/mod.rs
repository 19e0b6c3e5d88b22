use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use formsync_task_system::{IntoAnyTaskOutput, Task, TaskId, TaskOutput, TaskPriority};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum SampleError {
	#[error("sample error")]
	SampleError,
}

#[derive(Debug)]
pub struct ReadyTask {
	id: TaskId,
}

impl Default for ReadyTask {
	fn default() -> Self {
		Self {
			id: TaskId::new_v4(),
		}
	}
}

#[async_trait]
impl Task<SampleError> for ReadyTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self) -> Result<TaskOutput, SampleError> {
		Ok(TaskOutput::Empty)
	}
}

/// Records its label into a shared log when it runs.
#[derive(Debug)]
pub struct LoggingTask {
	id: TaskId,
	label: String,
	priority: TaskPriority,
	log: Arc<Mutex<Vec<String>>>,
}

impl LoggingTask {
	pub fn new(label: impl Into<String>, priority: TaskPriority, log: Arc<Mutex<Vec<String>>>) -> Self {
		Self {
			id: TaskId::new_v4(),
			label: label.into(),
			priority,
			log,
		}
	}
}

#[async_trait]
impl Task<SampleError> for LoggingTask {
	fn id(&self) -> TaskId {
		self.id
	}

	fn priority(&self) -> TaskPriority {
		self.priority
	}

	async fn run(&mut self) -> Result<TaskOutput, SampleError> {
		self.log.lock().unwrap().push(self.label.clone());
		tokio::task::yield_now().await;
		Ok(self.label.clone().into_output())
	}
}

#[derive(Debug)]
pub struct BrokenTask {
	id: TaskId,
}

impl Default for BrokenTask {
	fn default() -> Self {
		Self {
			id: TaskId::new_v4(),
		}
	}
}

#[async_trait]
impl Task<SampleError> for BrokenTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self) -> Result<TaskOutput, SampleError> {
		Err(SampleError::SampleError)
	}
}

#[derive(Debug)]
pub struct PanicTask {
	id: TaskId,
}

impl Default for PanicTask {
	fn default() -> Self {
		Self {
			id: TaskId::new_v4(),
		}
	}
}

#[async_trait]
impl Task<SampleError> for PanicTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self) -> Result<TaskOutput, SampleError> {
		panic!("this task always panics");
	}
}

#[derive(Debug)]
pub struct SlowTask {
	id: TaskId,
	sleep: Duration,
	timeout: Duration,
}

impl SlowTask {
	pub fn new(sleep: Duration, timeout: Duration) -> Self {
		Self {
			id: TaskId::new_v4(),
			sleep,
			timeout,
		}
	}
}

#[async_trait]
impl Task<SampleError> for SlowTask {
	fn id(&self) -> TaskId {
		self.id
	}

	fn with_timeout(&self) -> Option<Duration> {
		Some(self.timeout)
	}

	async fn run(&mut self) -> Result<TaskOutput, SampleError> {
		tokio::time::sleep(self.sleep).await;
		Ok(TaskOutput::Empty)
	}
}

/// Blocks its worker until the paired sender fires, notifying when it starts running.
#[derive(Debug)]
pub struct GateTask {
	id: TaskId,
	started_tx: Option<oneshot::Sender<()>>,
	open_rx: Option<oneshot::Receiver<()>>,
}

impl GateTask {
	pub fn new() -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
		let (started_tx, started_rx) = oneshot::channel();
		let (open_tx, open_rx) = oneshot::channel();
		(
			Self {
				id: TaskId::new_v4(),
				started_tx: Some(started_tx),
				open_rx: Some(open_rx),
			},
			started_rx,
			open_tx,
		)
	}
}

#[async_trait]
impl Task<SampleError> for GateTask {
	fn id(&self) -> TaskId {
		self.id
	}

	fn priority(&self) -> TaskPriority {
		TaskPriority::High
	}

	async fn run(&mut self) -> Result<TaskOutput, SampleError> {
		if let Some(started_tx) = self.started_tx.take() {
			started_tx.send(()).ok();
		}
		if let Some(open_rx) = self.open_rx.take() {
			open_rx.await.ok();
		}
		Ok(TaskOutput::Empty)
	}
}
