// Process Runner
// Executes step commands as child processes with bounded output capture

use crate::definition::validator::{PlannedStep, StepGuard};
use crate::error::StepError;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::MatrixBinding;
use crate::expression::{evaluate, render_template};
use crate::runners::{
    CapturedOutput, FailureKind, OutputLine, OutputStream, SkipReason, StepResult, StepStatus,
};

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to keep reading pipes after the child exited. Grandchildren may
/// hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Step executor for one job instance
#[derive(Clone)]
pub struct StepExecutor {
    output_limit: usize,
    default_timeout: Option<Duration>,
    job_index: usize,
    event_tx: Option<ProgressSender>,
}

impl StepExecutor {
    pub fn new(output_limit: usize) -> Self {
        Self {
            output_limit,
            default_timeout: None,
            job_index: 0,
            event_tx: None,
        }
    }

    /// Timeout for steps that do not set their own
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Publish every captured line as a `StepOutput` event
    pub fn with_events(mut self, job_index: usize, event_tx: Option<ProgressSender>) -> Self {
        self.job_index = job_index;
        self.event_tx = event_tx;
        self
    }

    /// Run one step for `binding` with the given base environment.
    ///
    /// A command that fails or cannot be launched is reported through the
    /// returned [`StepResult`]. `Err` means the executor lost track of the
    /// child process.
    pub async fn run(
        &self,
        step: &PlannedStep,
        binding: &MatrixBinding,
        env: &BTreeMap<String, String>,
    ) -> Result<StepResult, StepError> {
        let spec = &step.spec;

        if let StepGuard::Guarded(condition) = &step.guard {
            let enabled = evaluate(condition, binding).map_err(|e| StepError::Render {
                step: spec.name.clone(),
                message: e.to_string(),
            })?;
            if !enabled {
                tracing::debug!(step = %spec.name, condition = %condition, "condition is false");
                return Ok(StepResult::skipped(&spec.name, SkipReason::ConditionFalse));
            }
        }

        let render = |template: &str| {
            render_template(template, binding).map_err(|e| StepError::Render {
                step: spec.name.clone(),
                message: e.to_string(),
            })
        };

        let command = render(spec.run.as_str())?;
        let args = spec
            .args
            .iter()
            .map(|arg| render(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut step_env = env.clone();
        for (key, value) in &spec.env {
            step_env.insert(key.clone(), render(value.as_str())?);
        }

        let working_dir = spec.working_dir.as_deref().map(render).transpose()?;

        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);

        let started = Instant::now();
        let mut output = CapturedOutput::default();

        let program = match which::which(&command) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(step = %spec.name, command = %command, "command not found");
                return Ok(self.launch_failure(
                    &spec.name,
                    format!("command '{}' not found: {}", command, e),
                    started,
                ));
            }
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.envs(&step_env);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(step = %spec.name, error = %e, "failed to spawn step");
                return Ok(self.launch_failure(
                    &spec.name,
                    format!("failed to start '{}': {}", command, e),
                    started,
                ));
            }
        };

        tracing::debug!(step = %spec.name, pid = ?child.id(), "step started");

        // stdout and stderr share one channel so lines keep their arrival order
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                OutputStream::Stdout,
                self.output_limit,
                line_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                OutputStream::Stderr,
                self.output_limit,
                line_tx.clone(),
            ));
        }
        drop(line_tx);

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let exit = loop {
            tokio::select! {
                Some(event) = line_rx.recv() => self.receive(&spec.name, &mut output, event),
                status = child.wait() => {
                    break Some(status.map_err(|source| StepError::Wait {
                        step: spec.name.clone(),
                        source,
                    })?);
                }
                _ = sleep_until(deadline) => break None,
            }
        };

        let Some(status) = exit else {
            tracing::warn!(step = %spec.name, timeout = ?timeout, "step timed out");
            let _ = child.kill().await;
            self.drain(&spec.name, &mut output, &mut line_rx, &readers).await;
            output.push(
                OutputLine {
                    stream: OutputStream::Stderr,
                    text: format!("step timed out after {:?}", timeout.unwrap_or_default()),
                },
                usize::MAX,
            );
            return Ok(StepResult {
                name: spec.name.clone(),
                status: StepStatus::Failed {
                    kind: FailureKind::TimedOut,
                },
                exit_code: None,
                output,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        };

        self.drain(&spec.name, &mut output, &mut line_rx, &readers).await;

        let status_kind = if status.success() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed {
                kind: FailureKind::NonZeroExit,
            }
        };

        Ok(StepResult {
            name: spec.name.clone(),
            status: status_kind,
            exit_code: status.code(),
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn receive(&self, step: &str, output: &mut CapturedOutput, event: PipeEvent) {
        match event {
            PipeEvent::Line(line) => self.capture(step, output, line),
            PipeEvent::Overflow => output.mark_truncated(),
        }
    }

    fn capture(&self, step: &str, output: &mut CapturedOutput, line: OutputLine) {
        if !output.push(line.clone(), self.output_limit) {
            return;
        }
        self.event_tx.send_event(ExecutionEvent::StepOutput {
            job_index: self.job_index,
            step_name: step.to_string(),
            line,
        });
    }

    /// Collect whatever is still buffered in the pipes, then stop the readers
    async fn drain(
        &self,
        step: &str,
        output: &mut CapturedOutput,
        line_rx: &mut mpsc::UnboundedReceiver<PipeEvent>,
        readers: &[JoinHandle<()>],
    ) {
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, line_rx.recv()).await {
            self.receive(step, output, event);
        }
        for reader in readers {
            reader.abort();
        }
    }

    fn launch_failure(&self, name: &str, reason: String, started: Instant) -> StepResult {
        let mut output = CapturedOutput::default();
        self.capture(
            name,
            &mut output,
            OutputLine {
                stream: OutputStream::Stderr,
                text: reason,
            },
        );
        StepResult {
            name: name.to_string(),
            status: StepStatus::Failed {
                kind: FailureKind::LaunchFailure,
            },
            exit_code: None,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// What a pipe reader hands back to the step loop
enum PipeEvent {
    Line(OutputLine),
    /// The reader dropped bytes that did not fit its budget
    Overflow,
}

/// Splits raw pipe bytes into lines, holding at most `budget` bytes.
///
/// Bytes past the budget are dropped, including the rest of a line that
/// never ends, so a child writing without newlines cannot grow memory.
struct LineSplitter {
    pending: Vec<u8>,
    budget: usize,
    overflowed: bool,
}

impl LineSplitter {
    fn new(budget: usize) -> Self {
        Self {
            pending: Vec::new(),
            budget,
            overflowed: false,
        }
    }

    /// Consume a chunk and return the lines it completed
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append(&rest[..pos]);
            if let Some(line) = self.flush() {
                lines.push(line);
            }
            rest = &rest[pos + 1..];
        }
        self.append(rest);
        lines
    }

    /// The unterminated last line, if any
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            self.flush()
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        // one byte of the budget is reserved for the line terminator
        let room = self
            .budget
            .saturating_sub(1)
            .saturating_sub(self.pending.len());
        let keep = bytes.len().min(room);
        self.pending.extend_from_slice(&bytes[..keep]);
        if keep < bytes.len() {
            self.overflowed = true;
        }
    }

    fn flush(&mut self) -> Option<String> {
        if self.budget == 0 {
            self.pending.clear();
            self.overflowed = true;
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending)
            .trim_end_matches('\r')
            .to_string();
        self.pending.clear();
        self.budget = self.budget.saturating_sub(text.len() + 1);
        Some(text)
    }
}

/// Read the pipe until EOF or until nobody is listening. Output past
/// `budget` is read and discarded so the pipe never fills up. Invalid UTF-8
/// is replaced rather than ending the read.
fn spawn_reader<R>(
    mut pipe: R,
    stream: OutputStream,
    budget: usize,
    tx: mpsc::UnboundedSender<PipeEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new(budget);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut reported = false;
        loop {
            let n = match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for text in splitter.feed(&chunk[..n]) {
                if tx.send(PipeEvent::Line(OutputLine { stream, text })).is_err() {
                    return;
                }
            }
            if splitter.overflowed && !reported {
                reported = true;
                if tx.send(PipeEvent::Overflow).is_err() {
                    return;
                }
            }
        }
        if let Some(text) = splitter.finish() {
            let _ = tx.send(PipeEvent::Line(OutputLine { stream, text }));
        }
        if splitter.overflowed && !reported {
            let _ = tx.send(PipeEvent::Overflow);
        }
    })
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::models::StepSpec;
    use crate::expression::Condition;

    fn sh(name: &str, script: &str) -> PlannedStep {
        PlannedStep::unconditional(StepSpec {
            name: name.to_string(),
            run: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        })
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(1024 * 1024)
    }

    #[tokio::test]
    async fn test_run_success() {
        let result = executor()
            .run(&sh("hello", "echo hello"), &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output.text(), "hello");
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() {
        let result = executor()
            .run(&sh("fail", "exit 3"), &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            result.status,
            StepStatus::Failed {
                kind: FailureKind::NonZeroExit
            }
        );
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_launch_failure_for_missing_command() {
        let step = PlannedStep::unconditional(StepSpec {
            name: "missing".to_string(),
            run: "lattice-no-such-command-xyz".to_string(),
            ..Default::default()
        });
        let result = executor()
            .run(&step, &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            result.status,
            StepStatus::Failed {
                kind: FailureKind::LaunchFailure
            }
        );
        assert!(result.output.text().contains("not found"));
    }

    #[tokio::test]
    async fn test_condition_false_skips_without_spawning() {
        let mut step = sh("bench", "echo should-not-run");
        step.guard = StepGuard::Guarded(Condition::parse("channel == 'nightly'").unwrap());
        let binding = MatrixBinding::from_pairs([("channel", "stable")]);

        let result = executor()
            .run(&step, &binding, &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            result.status,
            StepStatus::Skipped {
                reason: SkipReason::ConditionFalse
            }
        );
        assert!(result.output.lines.is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_output_and_env() {
        let mut step = sh("mixed", "echo one; echo two >&2; echo $GREETING-$TOOLCHAIN");
        step.spec.env.insert(
            "TOOLCHAIN".to_string(),
            "${{ matrix.toolchain }}".to_string(),
        );
        let binding = MatrixBinding::from_pairs([("toolchain", "nightly")]);
        let env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);

        let result = executor().run(&step, &binding, &env).await.unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        let texts: Vec<&str> = result.output.lines.iter().map(|l| l.text.as_str()).collect();
        assert!(texts.contains(&"one"));
        assert!(texts.contains(&"two"));
        assert!(texts.contains(&"hi-nightly"));
        assert!(result
            .output
            .lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.text == "two"));
    }

    #[tokio::test]
    async fn test_output_limit_keeps_draining() {
        let step = sh("noisy", "i=0; while [ $i -lt 5000 ]; do echo line-$i; i=$((i+1)); done");
        let result = StepExecutor::new(100)
            .run(&step, &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        assert!(result.output.truncated);
        assert!(result.output.text().len() <= 100);
    }

    #[tokio::test]
    async fn test_endless_line_is_bounded() {
        let step = sh("flood", "head -c 5000000 /dev/zero | tr '\\0' a");
        let result = StepExecutor::new(100)
            .run(&step, &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        assert!(result.output.truncated);
        assert!(result.output.text().len() <= 100);
    }

    #[test]
    fn test_line_splitter_holds_at_most_budget() {
        let mut splitter = LineSplitter::new(16);
        assert!(splitter.feed(&[b'x'; 10_000]).is_empty());
        assert!(splitter.pending.len() < 16);
        assert!(splitter.overflowed);

        let lines = splitter.feed(b"\nmore\n");
        assert_eq!(lines, vec!["x".repeat(15)]);
        assert_eq!(splitter.budget, 0);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_line_splitter_splits_chunks() {
        let mut splitter = LineSplitter::new(1024);
        assert_eq!(splitter.feed(b"one\r\ntw"), vec!["one".to_string()]);
        assert_eq!(splitter.feed(b"o\nthree"), vec!["two".to_string()]);
        assert_eq!(splitter.finish(), Some("three".to_string()));
        assert!(!splitter.overflowed);
    }

    #[tokio::test]
    async fn test_command_is_rendered_from_binding() {
        let step = PlannedStep::unconditional(StepSpec {
            name: "tool".to_string(),
            run: "${{ matrix.tool }}".to_string(),
            ..Default::default()
        });
        let binding = MatrixBinding::from_pairs([("tool", "true")]);

        let result = executor().run(&step, &binding, &BTreeMap::new()).await.unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let mut step = sh("slow", "exec sleep 10");
        step.spec.timeout_secs = Some(1);

        let started = Instant::now();
        let result = executor()
            .run(&step, &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            result.status,
            StepStatus::Failed {
                kind: FailureKind::TimedOut
            }
        );
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_output_events_published() {
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let result = executor()
            .with_events(7, Some(tx))
            .run(&sh("echo", "echo event"), &MatrixBinding::empty(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ExecutionEvent::StepOutput { job_index: 7, ref line, .. } if line.text == "event"
        ));
    }
}
