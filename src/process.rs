// ABOUTME: Supervises chains of external tools piped stdout-to-stdin
// ABOUTME: Streams output chunks to a sink and kills the chain on cooperative cancellation

use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 8 * 1024;
/// How long output is still read after every stage has exited.
pub const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// One stage of a process chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Raw bytes read from one stream of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stage: usize,
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    Failure(ProcessFailure),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub program: String,
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    /// Spawn or wait error text, when the failure was not an exit code.
    pub error: Option<String>,
}

impl ProcessFailure {
    fn spawn(spec: &ProcessSpec, err: &io::Error) -> Self {
        Self {
            program: spec.program.clone(),
            exit_code: None,
            error: Some(format!("failed to start: {}", err)),
        }
    }

    fn exited(spec: &ProcessSpec, status: ExitStatus) -> Self {
        Self {
            program: spec.program.clone(),
            exit_code: status.code(),
            error: None,
        }
    }

    fn io(spec: &ProcessSpec, message: String) -> Self {
        Self {
            program: spec.program.clone(),
            exit_code: None,
            error: Some(message),
        }
    }

    pub fn killed_by_signal(&self) -> bool {
        self.exit_code.is_none() && self.error.is_none()
    }
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.error, self.exit_code) {
            (Some(error), _) => write!(f, "{} {}", self.program, error),
            (None, Some(code)) => write!(f, "{} exited with code {}", self.program, code),
            (None, None) => write!(f, "{} was terminated by a signal", self.program),
        }
    }
}

/// Polled on a fixed interval while a chain runs.
#[async_trait]
pub trait CancellationPoll: Send + Sync {
    async fn cancel_requested(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ProcessRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run `chain`, piping each stage's stdout into the next stage's stdin.
    ///
    /// Stderr of every stage and stdout of the last stage are pushed to
    /// `sink` as they arrive. The chain succeeds only if every stage exits
    /// with code 0. When `poll` reports a cancellation every stage is
    /// killed and the result is [`ProcessOutcome::Cancelled`], whatever
    /// exit codes the kill produces.
    ///
    /// Output still open once every stage has exited (a grandchild holding
    /// the pipe) is read for [`OUTPUT_GRACE`] and then abandoned.
    pub async fn run<F>(
        &self,
        chain: &[ProcessSpec],
        mut sink: F,
        poll: Option<&dyn CancellationPoll>,
    ) -> ProcessOutcome
    where
        F: FnMut(OutputChunk),
    {
        let Some(last_stage) = chain.len().checked_sub(1) else {
            return ProcessOutcome::Failure(ProcessFailure {
                program: String::new(),
                exit_code: None,
                error: Some("empty process chain".to_string()),
            });
        };

        let kill = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut waits = Vec::with_capacity(chain.len());
        let mut readers = Vec::with_capacity(chain.len() + 1);
        let mut upstream: Option<Stdio> = None;

        for (stage, spec) in chain.iter().enumerate() {
            debug!(program = %spec.program, args = ?spec.args, stage, "spawning process");

            let mut command = Command::new(&spec.program);
            command
                .args(&spec.args)
                .stdin(upstream.take().unwrap_or_else(Stdio::null))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    kill.cancel();
                    join_all(waits).await;
                    abort_readers(&readers);
                    return ProcessOutcome::Failure(ProcessFailure::spawn(spec, &e));
                }
            };

            if let Some(stderr) = child.stderr.take() {
                readers.push(spawn_reader(stage, OutputStream::Stderr, stderr, &tx));
            }
            if let Some(stdout) = child.stdout.take() {
                if stage == last_stage {
                    readers.push(spawn_reader(stage, OutputStream::Stdout, stdout, &tx));
                } else {
                    let piped: io::Result<Stdio> = stdout.try_into();
                    match piped {
                        Ok(stdio) => upstream = Some(stdio),
                        Err(e) => {
                            waits.push(spawn_waiter(child, kill.clone()));
                            kill.cancel();
                            join_all(waits).await;
                            abort_readers(&readers);
                            return ProcessOutcome::Failure(ProcessFailure::io(
                                spec,
                                format!("could not pipe output: {}", e),
                            ));
                        }
                    }
                }
            }

            waits.push(spawn_waiter(child, kill.clone()));
        }
        drop(tx);

        let mut all_exited = Box::pin(join_all(waits));
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut cancelled = false;

        let exits = loop {
            tokio::select! {
                Some(chunk) = rx.recv() => sink(chunk),
                exits = &mut all_exited => break exits,
                _ = ticker.tick(), if poll.is_some() && !cancelled => {
                    if let Some(poll) = poll {
                        if poll.cancel_requested().await {
                            info!(
                                program = %chain[0].program,
                                "cancellation requested, killing process chain"
                            );
                            cancelled = true;
                            kill.cancel();
                        }
                    }
                }
            }
        };

        let drained = tokio::time::timeout(OUTPUT_GRACE, async {
            while let Some(chunk) = rx.recv().await {
                sink(chunk);
            }
        })
        .await;
        if drained.is_err() {
            debug!("output still open after the chain exited, abandoning it");
            abort_readers(&readers);
            while let Ok(chunk) = rx.try_recv() {
                sink(chunk);
            }
        }

        if cancelled {
            return ProcessOutcome::Cancelled;
        }

        let mut failures = Vec::new();
        for (spec, exit) in chain.iter().zip(exits) {
            let failure = match exit {
                Ok(Ok(status)) if status.success() => continue,
                Ok(Ok(status)) => ProcessFailure::exited(spec, status),
                Ok(Err(e)) => ProcessFailure::io(spec, format!("could not be awaited: {}", e)),
                Err(e) => ProcessFailure::io(spec, format!("supervisor failed: {}", e)),
            };
            failures.push(failure);
        }
        if failures.is_empty() {
            return ProcessOutcome::Success;
        }

        // An upstream stage dying of SIGPIPE is a symptom of the stage that closed the pipe.
        let blamed = failures
            .iter()
            .position(|failure| !failure.killed_by_signal())
            .unwrap_or(0);
        ProcessOutcome::Failure(failures.swap_remove(blamed))
    }
}

fn spawn_reader<R>(
    stage: usize,
    stream: OutputStream,
    mut reader: R,
    tx: &mpsc::UnboundedSender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let tx = tx.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stage,
                        stream,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(stage, ?stream, error = %e, "stopped reading process output");
                    break;
                }
            }
        }
    })
}

fn abort_readers(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}

fn spawn_waiter(mut child: Child, kill: CancellationToken) -> JoinHandle<io::Result<ExitStatus>> {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(20))
    }

    struct CancelAfter {
        polls: AtomicUsize,
        after: usize,
    }

    impl CancelAfter {
        fn new(after: usize) -> Self {
            Self {
                polls: AtomicUsize::new(0),
                after,
            }
        }
    }

    #[async_trait]
    impl CancellationPoll for CancelAfter {
        async fn cancel_requested(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.after
        }
    }

    #[tokio::test]
    async fn test_single_stage_success_streams_both_streams() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let outcome = runner()
            .run(
                &[sh("echo out; echo err 1>&2")],
                |chunk| match chunk.stream {
                    OutputStream::Stdout => stdout.extend(chunk.bytes),
                    OutputStream::Stderr => stderr.extend(chunk.bytes),
                },
                None,
            )
            .await;

        assert_eq!(outcome, ProcessOutcome::Success);
        assert_eq!(String::from_utf8_lossy(&stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err\n");
    }

    #[tokio::test]
    async fn test_pipes_stdout_into_next_stage() {
        let mut stdout = Vec::new();
        let chain = [
            sh("printf 'hello'"),
            ProcessSpec::new("tr").args(["a-z", "A-Z"]),
        ];

        let outcome = runner()
            .run(
                &chain,
                |chunk| {
                    if chunk.stream == OutputStream::Stdout {
                        assert_eq!(chunk.stage, 1);
                        stdout.extend(chunk.bytes);
                    }
                },
                None,
            )
            .await;

        assert_eq!(outcome, ProcessOutcome::Success);
        assert_eq!(String::from_utf8_lossy(&stdout), "HELLO");
    }

    #[tokio::test]
    async fn test_last_stage_non_zero_exit_is_failure() {
        let chain = [sh("exit 0"), sh("cat > /dev/null; exit 2")];
        let outcome = runner().run(&chain, |_| {}, None).await;

        match outcome {
            ProcessOutcome::Failure(failure) => {
                assert_eq!(failure.program, "sh");
                assert_eq!(failure.exit_code, Some(2));
                assert_eq!(failure.to_string(), "sh exited with code 2");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_stage_non_zero_exit_is_failure() {
        let chain = [sh("exit 3"), sh("cat > /dev/null")];
        let outcome = runner().run(&chain, |_| {}, None).await;

        assert!(matches!(
            outcome,
            ProcessOutcome::Failure(ProcessFailure {
                exit_code: Some(3),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_later_exit_code_is_blamed_over_earlier_signal() {
        let chain = [sh("kill -TERM $$"), sh("cat > /dev/null; exit 5")];
        let outcome = runner().run(&chain, |_| {}, None).await;

        match outcome {
            ProcessOutcome::Failure(failure) => {
                assert_eq!(failure.exit_code, Some(5));
                assert!(!failure.killed_by_signal());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signal_is_reported_when_nothing_else_failed() {
        let chain = [sh("cat > /dev/null"), sh("kill -TERM $$")];
        let outcome = runner().run(&chain, |_| {}, None).await;

        match outcome {
            ProcessOutcome::Failure(failure) => {
                assert!(failure.killed_by_signal());
                assert_eq!(failure.to_string(), "sh was terminated by a signal");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_error_is_failure() {
        let chain = [ProcessSpec::new("definitely-not-a-real-tool-4921")];
        let outcome = runner().run(&chain, |_| {}, None).await;

        match outcome {
            ProcessOutcome::Failure(failure) => {
                assert_eq!(failure.exit_code, None);
                assert!(failure.error.unwrap().starts_with("failed to start"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_error_in_later_stage_kills_earlier_stages() {
        let started = Instant::now();
        let chain = [
            ProcessSpec::new("sleep").arg("5"),
            ProcessSpec::new("definitely-not-a-real-tool-4921"),
        ];
        let outcome = runner().run(&chain, |_| {}, None).await;

        assert!(matches!(outcome, ProcessOutcome::Failure(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancellation_takes_priority_over_kill_exit_codes() {
        let poll = CancelAfter::new(2);
        let started = Instant::now();
        let chain = [
            ProcessSpec::new("sleep").arg("5"),
            ProcessSpec::new("sleep").arg("5"),
        ];

        let outcome = runner().run(&chain, |_| {}, Some(&poll)).await;

        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancellation_does_not_wait_for_grandchild_holding_output() {
        // The shell is killed but its `sleep` keeps stdout and stderr open.
        let poll = CancelAfter::new(1);
        let started = Instant::now();

        let outcome = runner()
            .run(&[sh("sleep 4; echo done")], |_| {}, Some(&poll))
            .await;

        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_output_written_before_exit_is_still_delivered() {
        let mut stdout = Vec::new();

        let outcome = runner()
            .run(
                &[sh("echo first; sleep 3 & echo second")],
                |chunk| {
                    if chunk.stream == OutputStream::Stdout {
                        stdout.extend(chunk.bytes);
                    }
                },
                None,
            )
            .await;

        assert_eq!(outcome, ProcessOutcome::Success);
        assert_eq!(String::from_utf8_lossy(&stdout), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_poll_without_cancellation_lets_chain_finish() {
        let poll = CancelAfter::new(usize::MAX);

        let outcome = runner()
            .run(&[sh("sleep 0.1; exit 0")], |_| {}, Some(&poll))
            .await;

        assert_eq!(outcome, ProcessOutcome::Success);
        assert!(poll.polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_empty_chain_is_failure() {
        let outcome = runner().run(&[], |_| {}, None).await;
        assert!(matches!(outcome, ProcessOutcome::Failure(_)));
    }
}
