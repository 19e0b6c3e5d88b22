use formsync_task_system::{TaskOutput, TaskPriority, TaskStatus, TaskSystem, TaskSystemError};

use std::{
	num::NonZeroUsize,
	sync::{Arc, Mutex},
	time::Duration,
};

use futures_concurrency::future::Join;
use tracing_test::traced_test;

mod common;

use common::{BrokenTask, GateTask, LoggingTask, PanicTask, ReadyTask, SampleError, SlowTask};

fn workers(count: usize) -> NonZeroUsize {
	NonZeroUsize::new(count).unwrap()
}

#[tokio::test]
#[traced_test]
async fn done_test() {
	let system = TaskSystem::<SampleError>::new(workers(2));

	let handle = system.dispatch(ReadyTask::default()).await.unwrap();

	system.drain().await;

	assert!(matches!(
		handle.await,
		Ok(TaskStatus::Done((_task_id, TaskOutput::Empty)))
	));
}

#[tokio::test]
#[traced_test]
async fn error_test() {
	let system = TaskSystem::<SampleError>::new(workers(1));

	let handle = system.dispatch(BrokenTask::default()).await.unwrap();

	system.drain().await;

	assert!(matches!(
		handle.await,
		Ok(TaskStatus::Error(SampleError::SampleError))
	));
}

#[tokio::test]
#[traced_test]
async fn panic_is_reported_and_worker_survives_test() {
	let system = TaskSystem::<SampleError>::new(workers(1));

	let panicking = system.dispatch(PanicTask::default()).await.unwrap();
	let panicking_id = panicking.task_id();
	let ready = system.dispatch(ReadyTask::default()).await.unwrap();

	system.drain().await;

	assert!(matches!(
		panicking.await,
		Err(TaskSystemError::TaskPanic(id)) if id == panicking_id
	));
	assert!(matches!(ready.await, Ok(TaskStatus::Done(_))));
}

#[tokio::test]
#[traced_test]
async fn timeout_test() {
	let system = TaskSystem::<SampleError>::new(workers(1));

	let slow = system
		.dispatch(SlowTask::new(Duration::from_secs(30), Duration::from_millis(20)))
		.await
		.unwrap();
	let slow_id = slow.task_id();

	system.drain().await;

	assert!(matches!(slow.await, Ok(TaskStatus::TimedOut(id)) if id == slow_id));
}

#[tokio::test]
#[traced_test]
async fn high_priority_lane_first_test() {
	let log = Arc::new(Mutex::new(Vec::new()));
	let system = TaskSystem::<SampleError>::new(workers(1));

	let tasks = (0..20).map(|i| {
		let priority = if i % 3 == 0 {
			TaskPriority::High
		} else {
			TaskPriority::Normal
		};
		LoggingTask::new(format!("{priority:?}-{i}"), priority, Arc::clone(&log))
	});

	let handles = system.dispatch_many(tasks.collect::<Vec<_>>()).await.unwrap();

	system.drain().await;

	let outputs = handles.join().await;
	assert_eq!(outputs.len(), 20);

	for output in outputs {
		match output {
			Ok(TaskStatus::Done((_, TaskOutput::Out(out)))) => {
				assert!(out.downcast::<String>().is_ok());
			}
			other => panic!("unexpected task status: {other:?}"),
		}
	}

	let log = log.lock().unwrap();
	let first_normal = log
		.iter()
		.position(|label| label.starts_with("Normal"))
		.unwrap();
	let last_high = log
		.iter()
		.rposition(|label| label.starts_with("High"))
		.unwrap();

	assert_eq!(log.len(), 20);
	assert!(
		last_high < first_normal,
		"high priority tasks must run before normal ones: {log:?}"
	);
}

#[tokio::test]
#[traced_test]
async fn many_workers_run_everything_test() {
	let log = Arc::new(Mutex::new(Vec::new()));
	let system = TaskSystem::<SampleError>::new(workers(4));

	let handles = system
		.dispatch_many(
			(0..50)
				.map(|i| LoggingTask::new(i.to_string(), TaskPriority::Normal, Arc::clone(&log)))
				.collect::<Vec<_>>(),
		)
		.await
		.unwrap();

	assert_eq!(system.workers_count(), 4);

	system.drain().await;

	assert!(handles
		.join()
		.await
		.into_iter()
		.all(|res| matches!(res, Ok(TaskStatus::Done(_)))));
	assert_eq!(log.lock().unwrap().len(), 50);
}

#[tokio::test]
#[traced_test]
async fn shutdown_hands_back_pending_tasks_test() {
	let system = TaskSystem::<SampleError>::new(workers(1));

	let (gate, started_rx, open_tx) = GateTask::new();
	let gate_handle = system.dispatch(gate).await.unwrap();
	started_rx.await.unwrap();

	let pending = system.dispatch(ReadyTask::default()).await.unwrap();

	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(50)).await;
		open_tx.send(()).ok();
	});

	system.shutdown().await;

	assert!(matches!(gate_handle.await, Ok(TaskStatus::Done(_))));
	assert!(matches!(pending.await, Ok(TaskStatus::Shutdown(_))));
}
