//! Execution Supervisor
//!
//! Runs at most one user program at a time under a project's Python
//! environment, streams its output line by line to an [`OutputSink`], and
//! kills it when the client stops sending heartbeats.

use crate::error::{CoreError, CoreResult};
use crate::events::OutputSink;
use robot_link_shared::timing;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Lines buffered between a stream reader and the sink
const LINE_QUEUE: usize = 64;

/// Mutable supervisor state, guarded by one lock
#[derive(Debug)]
struct ExecutionState {
    running: bool,
    pid: Option<u32>,
    /// Signals the waiter task owning the child to kill it
    kill_tx: Option<oneshot::Sender<()>>,
    /// Bumped on every start so a stale waiter cannot clear a newer run
    generation: u64,
    last_heartbeat: Instant,
}

impl ExecutionState {
    fn new() -> Self {
        Self {
            running: false,
            pid: None,
            kill_tx: None,
            generation: 0,
            last_heartbeat: Instant::now(),
        }
    }

    /// Kill the live process if any. Returns whether one was running.
    fn kill(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.pid = None;
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        true
    }
}

fn lock(state: &Mutex<ExecutionState>) -> MutexGuard<'_, ExecutionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Path of the interpreter inside a virtual environment
fn interpreter_path(environment: &Path) -> PathBuf {
    if cfg!(windows) {
        environment.join("Scripts").join("python.exe")
    } else {
        environment.join("bin").join("python")
    }
}

fn check_interpreter(python: &Path) -> CoreResult<()> {
    let metadata = std::fs::metadata(python).map_err(|e| {
        CoreError::SpawnFailed(format!("Python executable not found at {}: {}", python.display(), e))
    })?;

    if !metadata.is_file() {
        return Err(CoreError::SpawnFailed(format!(
            "Python executable not found at {}",
            python.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(CoreError::SpawnFailed(format!(
                "{} is not executable",
                python.display()
            )));
        }
    }

    Ok(())
}

/// Supervises the single user program
pub struct ExecutionSupervisor {
    sink: Arc<dyn OutputSink>,
    state: Arc<Mutex<ExecutionState>>,
    heartbeat_timeout: Duration,
}

impl ExecutionSupervisor {
    /// Create a supervisor with the default heartbeat timeout.
    /// The heartbeat clock starts now.
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new(ExecutionState::new())),
            heartbeat_timeout: Duration::from_millis(timing::HEARTBEAT_TIMEOUT_MS),
        }
    }

    /// Override the heartbeat timeout (builder-style)
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.state).pid
    }

    /// Record a heartbeat from the client
    pub fn beat(&self) {
        lock(&self.state).last_heartbeat = Instant::now();
    }

    /// Forcibly stop the running program. No-op when nothing runs.
    pub fn kill(&self) -> bool {
        let killed = lock(&self.state).kill();
        if killed {
            info!("[EXEC] Program killed");
        }
        killed
    }

    /// Run `<environment>/bin/python -u <script>`.
    ///
    /// Returns false without starting anything when the interpreter is
    /// missing or cannot be executed. A program that is already running is
    /// killed first.
    pub fn start(&self, environment: &Path, script: &Path) -> bool {
        match self.spawn_program(environment, script) {
            Ok(pid) => {
                info!("[EXEC] Started {} (pid {})", script.display(), pid);
                true
            }
            Err(e) => {
                warn!("[EXEC] {}", e);
                false
            }
        }
    }

    fn spawn_program(&self, environment: &Path, script: &Path) -> CoreResult<u32> {
        let python = interpreter_path(environment);
        check_interpreter(&python)?;

        let mut state = lock(&self.state);
        if state.kill() {
            info!("[EXEC] Replacing running program");
        }

        let mut child = Command::new(&python)
            .arg("-u")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::SpawnFailed(format!("{}: {}", python.display(), e)))?;

        let pid = child.id().unwrap_or_default();
        let (kill_tx, kill_rx) = oneshot::channel();

        state.generation += 1;
        state.running = true;
        state.pid = Some(pid);
        state.kill_tx = Some(kill_tx);
        state.last_heartbeat = Instant::now();
        let generation = state.generation;
        drop(state);

        if let Some(stdout) = child.stdout.take() {
            let sink = self.sink.clone();
            forward_lines(stdout, "stdout", move |line| sink.on_stdout(line));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = self.sink.clone();
            forward_lines(stderr, "stderr", move |line| sink.on_stderr(line));
        }

        tokio::spawn(wait_for_exit(child, kill_rx, self.state.clone(), generation));

        Ok(pid)
    }

    /// Start the heartbeat watchdog.
    ///
    /// Every `period` the watchdog kills the program if no heartbeat arrived
    /// within the timeout. The task stops when the handle is dropped.
    pub fn start_watchdog(&self, period: Duration) -> WatchdogHandle {
        let state = self.state.clone();
        let timeout = self.heartbeat_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;

                let mut guard = lock(&state);
                let silent_for = guard.last_heartbeat.elapsed();
                if silent_for > timeout && guard.kill() {
                    drop(guard);
                    warn!(
                        "[EXEC] No heartbeat for {} ms, program killed",
                        silent_for.as_millis()
                    );
                }
            }
        });

        WatchdogHandle { task }
    }
}

/// Handle keeping the watchdog alive
pub struct WatchdogHandle {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Own the child until it exits or a kill is requested
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<ExecutionState>>,
    generation: u64,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!("[EXEC] Program exited: {}", status),
            Err(e) => error!("[EXEC] Failed waiting for program: {}", e),
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                error!("[EXEC] Failed to kill program: {}", e);
            }
        }
    }

    let mut state = lock(&state);
    if state.generation == generation {
        state.running = false;
        state.pid = None;
        state.kill_tx = None;
    }
}

/// Read lines from a pipe into a bounded queue drained by a forwarder
fn forward_lines<R, F>(stream: R, label: &'static str, emit: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(&str) + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(LINE_QUEUE);

    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("[EXEC] Error reading {}: {}", label, e);
                    break;
                }
            }
        }
        debug!("[EXEC] {} closed", label);
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            emit(&line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A fake environment whose `bin/python` runs the script with /bin/sh
    fn fake_env() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\nshift\nexec /bin/sh \"$@\"\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("main.py");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn supervisor(sink: Arc<RecordingSink>) -> ExecutionSupervisor {
        ExecutionSupervisor::new(sink)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(Arc::new(RecordingSink::default()));

        assert!(!sup.start(dir.path(), &dir.path().join("main.py")));
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn test_non_executable_interpreter_fails_fast() {
        let env = fake_env();
        let python = interpreter_path(env.path());
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o644)).unwrap();
        let sup = supervisor(Arc::new(RecordingSink::default()));

        assert!(!sup.start(env.path(), &script(&env, "true\n")));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_output_is_forwarded_per_stream() {
        let env = fake_env();
        let sink = Arc::new(RecordingSink::default());
        let sup = supervisor(sink.clone());

        let main = script(&env, "echo hello\necho world\necho oops >&2\n");
        assert!(sup.start(env.path(), &main));

        assert!(wait_until(|| sink.stdout_lines().len() == 2, Duration::from_secs(5)).await);
        assert!(wait_until(|| sink.stderr_lines().len() == 1, Duration::from_secs(5)).await);
        assert_eq!(sink.stdout_lines(), vec!["hello\n", "world\n"]);
        assert_eq!(sink.stderr_lines(), vec!["oops\n"]);

        // Exit is observed asynchronously
        assert!(wait_until(|| !sup.is_running(), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let env = fake_env();
        let sup = supervisor(Arc::new(RecordingSink::default()));

        assert!(sup.start(env.path(), &script(&env, "sleep 30\n")));
        assert!(sup.is_running());
        assert!(sup.pid().is_some());

        assert!(sup.kill());
        assert!(!sup.is_running());
        assert!(!sup.kill());
    }

    #[tokio::test]
    async fn test_start_replaces_running_program() {
        let env = fake_env();
        let sup = supervisor(Arc::new(RecordingSink::default()));
        let main = script(&env, "sleep 30\n");

        assert!(sup.start(env.path(), &main));
        let first = sup.pid();
        assert!(sup.start(env.path(), &main));
        let second = sup.pid();

        assert_ne!(first, second);
        // The first run's waiter must not clear the second run
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.is_running());
        assert_eq!(sup.pid(), second);
        sup.kill();
    }

    #[tokio::test]
    async fn test_watchdog_kills_after_heartbeat_timeout() {
        let env = fake_env();
        let sup = supervisor(Arc::new(RecordingSink::default()));
        let _watchdog = sup.start_watchdog(Duration::from_millis(timing::WATCHDOG_INTERVAL_MS));

        sup.beat();
        assert!(sup.start(env.path(), &script(&env, "sleep 30\n")));

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(sup.is_running(), "killed before the heartbeat window elapsed");

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!sup.is_running(), "still running 3.6 s after the last heartbeat");
    }

    #[tokio::test]
    async fn test_heartbeats_keep_program_alive() {
        let env = fake_env();
        let sup = supervisor(Arc::new(RecordingSink::default()))
            .with_heartbeat_timeout(Duration::from_millis(300));
        let _watchdog = sup.start_watchdog(Duration::from_millis(50));

        assert!(sup.start(env.path(), &script(&env, "sleep 30\n")));
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sup.beat();
        }
        assert!(sup.is_running());

        assert!(wait_until(|| !sup.is_running(), Duration::from_secs(2)).await);
    }
}
