//! Command dispatcher - the single serialization point for commands
//!
//! Both transports submit commands here. A single worker executes them one
//! at a time, so the supervisor and the device synchronizer are never driven
//! by two commands at once.

use async_trait::async_trait;
use futures::FutureExt;
use robot_link_shared::{Command, CommandResult};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Executes one decoded command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> CommandResult;
}

/// A queued command and where its result goes
struct Job {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

/// Cloneable handle to the dispatcher queue
#[derive(Clone)]
pub struct CommandDispatcher {
    jobs: mpsc::Sender<Job>,
}

impl CommandDispatcher {
    /// Start the worker. The queue holds `capacity` pending commands before
    /// submitters wait.
    pub fn spawn(handler: Arc<dyn CommandHandler>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (jobs, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(handler, rx));
        (Self { jobs }, worker)
    }

    /// Queue a command without waiting for it to run.
    ///
    /// Commands submitted one after another from the same task run in that
    /// order.
    pub async fn submit(&self, command: Command) -> PendingResult {
        let (reply, result) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Job { command, reply }).await {
            let _ = job.reply.send(CommandResult::failed("dispatcher stopped"));
        }
        PendingResult(result)
    }

    /// Queue a command and wait for its result
    pub async fn execute(&self, command: Command) -> CommandResult {
        self.submit(command).await.wait().await
    }
}

/// Result of a submitted command, available once the worker has run it
pub struct PendingResult(oneshot::Receiver<CommandResult>);

impl PendingResult {
    pub async fn wait(self) -> CommandResult {
        self.0
            .await
            .unwrap_or_else(|_| CommandResult::failed("dispatcher stopped"))
    }
}

async fn run_worker(handler: Arc<dyn CommandHandler>, mut rx: mpsc::Receiver<Job>) {
    while let Some(Job { command, reply }) = rx.recv().await {
        let endpoint = command.endpoint.clone();
        let started = Instant::now();

        let result = AssertUnwindSafe(handler.handle(command))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("[DISPATCH] Handler for '{}' panicked", endpoint);
                CommandResult::failed("command handler panicked")
            });

        debug!(
            "[DISPATCH] {} -> success={} ({} ms)",
            endpoint,
            result.success,
            started.elapsed().as_millis()
        );

        // The submitter may have gone away; nothing to do then
        let _ = reply.send(result);
    }

    debug!("[DISPATCH] Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records how many commands run at the same time
    #[derive(Default)]
    struct Recorder {
        active: AtomicUsize,
        peak: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, command: Command) -> CommandResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            match command.endpoint.as_str() {
                "slow" => tokio::time::sleep(Duration::from_millis(25)).await,
                "panic" => panic!("boom"),
                _ => tokio::task::yield_now().await,
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            CommandResult::ok(command.endpoint)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commands_from_two_transports_never_overlap() {
        let recorder = Arc::new(Recorder::default());
        let (dispatcher, _worker) = CommandDispatcher::spawn(recorder.clone(), 8);

        let mut tasks = Vec::new();
        for transport in 0..2 {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    let endpoint = if (i + transport) % 3 == 0 { "slow" } else { "fast" };
                    let result = dispatcher.execute(Command::new(endpoint)).await;
                    assert!(result.success);
                    assert_eq!(result.response.to_text(), endpoint);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(recorder.handled.load(Ordering::SeqCst), 20);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_worker_alive() {
        let recorder = Arc::new(Recorder::default());
        let (dispatcher, _worker) = CommandDispatcher::spawn(recorder, 4);

        let result = dispatcher.execute(Command::new("panic")).await;
        assert!(!result.success);
        assert_eq!(result.response.to_text(), "command handler panicked");

        let result = dispatcher.execute(Command::new("fast")).await;
        assert!(result.success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submitted_commands_run_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Ordered(Arc<std::sync::Mutex<Vec<String>>>);

        #[async_trait]
        impl CommandHandler for Ordered {
            async fn handle(&self, command: Command) -> CommandResult {
                tokio::task::yield_now().await;
                self.0.lock().unwrap().push(command.endpoint.clone());
                CommandResult::ok(command.endpoint)
            }
        }

        let (dispatcher, _worker) = CommandDispatcher::spawn(Arc::new(Ordered(order.clone())), 4);

        let mut pending = Vec::new();
        for i in 0..50 {
            pending.push(dispatcher.submit(Command::new(format!("c{}", i))).await);
        }
        // Wait in reverse; execution order must not depend on who waits first
        let mut replies = Vec::new();
        for result in pending.into_iter().rev() {
            replies.push(result.wait().await.response.to_text());
        }
        replies.reverse();

        let expected: Vec<String> = (0..50).map(|i| format!("c{}", i)).collect();
        assert_eq!(replies, expected);
        assert_eq!(*order.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_stopped_dispatcher() {
        let (dispatcher, worker) = CommandDispatcher::spawn(Arc::new(Recorder::default()), 4);
        worker.abort();
        let _ = worker.await;

        let result = dispatcher.execute(Command::new("fast")).await;
        assert_eq!(result, CommandResult::failed("dispatcher stopped"));
    }
}
