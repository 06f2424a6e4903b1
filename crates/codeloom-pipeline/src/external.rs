//! Collaborators backed by external commands.
//!
//! [`AgentCommand`] speaks a one-shot JSON protocol with any program that
//! plans and writes code: one request object on stdin, one response object on
//! stdout. [`ShellTestRunner`] validates a file by running a shell command in
//! a scratch directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use codeloom_types::{
    Artifact, ExecutionFeedback, FileRecord, LoomError, Result, RetryContext, Task, TestOutcome,
};

use crate::collaborators::{
    test_artifact_path, CodeGenerator, ExecutionRunner, GeneratedCode, Plan, Planner,
    TestGenerator,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Characters of command output kept in failing test messages.
const OUTPUT_TAIL: usize = 2000;

// ---------------------------------------------------------------------------
// Agent command
// ---------------------------------------------------------------------------

/// An external program acting as planner, code generator and test generator.
///
/// Each call spawns `program args..`, writes a JSON request with an `op`
/// field (`plan`, `generate` or `generate_tests`) to stdin and parses stdout
/// as the JSON response.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Split a command line on whitespace into program and arguments.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one request and return stdout. Errors are plain strings so each
    /// caller can wrap them in its own error kind.
    async fn call(&self, request: serde_json::Value) -> std::result::Result<String, String> {
        let op = request["op"].as_str().unwrap_or("unknown").to_string();
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", self.program, e))?;
        let payload = serde_json::to_vec(&request).map_err(|e| e.to_string())?;
        let stdin = child.stdin.take();
        // Written while stdout and stderr drain. An agent may answer without
        // reading its input, so a broken pipe is ignored.
        let write_request = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (written, output) = tokio::time::timeout(self.timeout, async {
            tokio::join!(write_request, child.wait_with_output())
        })
        .await
        .map_err(|_| format!("'{}' timed out after {}s", op, self.timeout.as_secs()))?;
        written.map_err(|e| format!("failed to write request: {}", e))?;
        let output = output.map_err(|e| format!("'{}' failed: {}", op, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        tracing::debug!(
            program = %self.program,
            op = %op,
            exit_code = output.status.code().unwrap_or(-1),
            stdout_len = stdout.len(),
            "Agent command completed"
        );
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "'{}' exited with {}: {}",
                op,
                output.status.code().unwrap_or(-1),
                tail(stderr.trim(), OUTPUT_TAIL)
            ));
        }
        Ok(stdout)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        request: serde_json::Value,
    ) -> std::result::Result<T, String> {
        let stdout = self.call(request).await?;
        serde_json::from_str(stdout.trim()).map_err(|e| format!("malformed response: {}", e))
    }
}

#[async_trait]
impl Planner for AgentCommand {
    async fn plan(&self, requirements: &str) -> Result<Plan> {
        let request = serde_json::json!({ "op": "plan", "requirements": requirements });
        self.call_json(request).await.map_err(LoomError::Planning)
    }
}

#[async_trait]
impl CodeGenerator for AgentCommand {
    async fn generate(
        &self,
        task: &Task,
        context: &str,
        retry: Option<&RetryContext>,
    ) -> Result<GeneratedCode> {
        let request = serde_json::json!({
            "op": "generate",
            "task": task,
            "context": context,
            "retry": retry,
        });
        self.call_json(request)
            .await
            .map_err(|message| LoomError::Generation {
                task: task.index,
                message,
            })
    }
}

#[async_trait]
impl TestGenerator for AgentCommand {
    async fn generate_tests(&self, files: &BTreeMap<String, FileRecord>) -> Result<Vec<Artifact>> {
        let sources: BTreeMap<&str, String> = files
            .values()
            .filter(|r| !r.is_empty())
            .map(|r| (r.path.as_str(), r.content()))
            .collect();
        let request = serde_json::json!({ "op": "generate_tests", "files": sources });
        self.call_json(request).await.map_err(LoomError::Other)
    }
}

// ---------------------------------------------------------------------------
// Shell test runner
// ---------------------------------------------------------------------------

/// Validates a file by running `sh -c <command>` in a scratch directory that
/// holds the file (and its generated tests) at their relative paths.
///
/// The command sees `CODELOOM_FILE` and, when tests were generated,
/// `CODELOOM_TEST_FILE`. Exit status zero passes the attempt. An optional
/// syntax command runs first; when it fails the file is reported as
/// structurally invalid and the tests are skipped.
#[derive(Debug, Clone)]
pub struct ShellTestRunner {
    pub command: String,
    pub syntax_command: Option<String>,
    pub timeout: Duration,
}

impl ShellTestRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            syntax_command: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_syntax_check(mut self, command: impl Into<String>) -> Self {
        self.syntax_command = Some(command.into());
        self
    }

    async fn stage_files(
        dir: &Path,
        record: &FileRecord,
        test_code: Option<&str>,
    ) -> std::io::Result<Option<String>> {
        write_under(dir, &record.path, &record.content()).await?;
        match test_code {
            Some(code) => {
                let test_path = test_artifact_path(&record.path);
                write_under(dir, &test_path, code).await?;
                Ok(Some(test_path))
            }
            None => Ok(None),
        }
    }

    async fn execute(
        &self,
        task: &Task,
        dir: &Path,
        record: &FileRecord,
        test_code: Option<&str>,
    ) -> Result<ExecutionFeedback> {
        let env_err = |message: String| LoomError::ExecutionEnvironment {
            task: task.index,
            message,
        };
        let test_path = Self::stage_files(dir, record, test_code)
            .await
            .map_err(|e| env_err(format!("failed to stage files: {}", e)))?;

        if let Some(syntax) = &self.syntax_command {
            let output = self
                .shell(syntax, dir, &record.path, test_path.as_deref())
                .await
                .map_err(|e| env_err(format!("syntax command {}", e)))?;
            let exit_code = output.status.code().unwrap_or(-1);
            tracing::info!(task = task.index, file = %record.path, exit_code, "Syntax command completed");
            if !output.status.success() {
                let combined = combined_output(&output);
                let errors: Vec<String> = tail(combined.trim(), OUTPUT_TAIL)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(String::from)
                    .collect();
                return Ok(ExecutionFeedback::invalid(errors));
            }
        }

        let output = self
            .shell(&self.command, dir, &record.path, test_path.as_deref())
            .await
            .map_err(|e| env_err(format!("test command {}", e)))?;
        let exit_code = output.status.code().unwrap_or(-1);
        tracing::info!(task = task.index, file = %record.path, exit_code, "Test command completed");

        if output.status.success() {
            return Ok(ExecutionFeedback::new(
                true,
                vec![],
                vec![TestOutcome::passed("test command")],
            ));
        }
        let combined = combined_output(&output);
        let message = format!("exit code {}\n{}", exit_code, tail(combined.trim(), OUTPUT_TAIL));
        Ok(ExecutionFeedback::new(
            true,
            vec![],
            vec![TestOutcome::failed("test command", message)],
        ))
    }

    /// Run `sh -c command` in `dir` within the timeout. The error is a
    /// sentence fragment for the caller to prefix.
    async fn shell(
        &self,
        command: &str,
        dir: &Path,
        file: &str,
        test_path: Option<&str>,
    ) -> std::result::Result<std::process::Output, String> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(dir)
            .env("CODELOOM_FILE", file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(test_path) = test_path {
            cmd.env("CODELOOM_TEST_FILE", test_path);
        }

        let child = cmd.spawn().map_err(|e| format!("could not start: {}", e))?;
        tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("failed: {}", e))
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        combined.push('\n');
        combined.push_str(&stderr);
    }
    combined
}

#[async_trait]
impl ExecutionRunner for ShellTestRunner {
    async fn run(
        &self,
        task: &Task,
        record: &FileRecord,
        test_code: Option<&str>,
    ) -> Result<ExecutionFeedback> {
        let dir = scratch_dir();
        let result = self.execute(task, &dir, record, test_code).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::debug!(dir = %dir.display(), error = %e, "Failed to remove scratch directory");
        }
        result
    }
}

/// A runner that accepts every file without checking it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UncheckedRunner;

#[async_trait]
impl ExecutionRunner for UncheckedRunner {
    async fn run(
        &self,
        _task: &Task,
        _record: &FileRecord,
        _test_code: Option<&str>,
    ) -> Result<ExecutionFeedback> {
        Ok(ExecutionFeedback::new(true, vec![], vec![]))
    }
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("codeloom-run-{}", uuid::Uuid::new_v4()))
}

async fn write_under(dir: &Path, relative: &str, content: &str) -> std::io::Result<()> {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

/// The last `max` characters of `text`.
fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((i, _)) => &text[i..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use codeloom_types::{Fragment, TaskAction, TaskStatus};

    use super::*;

    fn task() -> Task {
        Task {
            index: 4,
            target_file: "calc.py".into(),
            description: "add".into(),
            action: TaskAction::Create,
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }

    fn record() -> FileRecord {
        let mut record = FileRecord::new("pkg/calc.py", "math");
        record.fragments.push(Fragment {
            task: 4,
            code: "def add(a, b):\n    return a + b\n".into(),
            symbols: vec!["add".into()],
        });
        record
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[test]
    fn command_line_splits_program_and_args() {
        let cmd = AgentCommand::from_command_line("python3 agent.py --fast").unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["agent.py", "--fast"]);
        assert!(AgentCommand::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn shell_runner_passes_on_zero_exit() {
        let runner = ShellTestRunner::new("grep -q 'def add' \"$CODELOOM_FILE\"");
        let feedback = runner.run(&task(), &record(), None).await.unwrap();
        assert!(feedback.overall_pass);
    }

    #[tokio::test]
    async fn shell_runner_reports_failure_output() {
        let runner = ShellTestRunner::new("echo broken >&2; exit 3");
        let feedback = runner.run(&task(), &record(), None).await.unwrap();
        assert!(!feedback.overall_pass);
        assert!(feedback.tests[0].message.as_deref().unwrap_or("").contains("broken"));
    }

    #[tokio::test]
    async fn shell_runner_writes_test_file() {
        let runner = ShellTestRunner::new("test \"$CODELOOM_TEST_FILE\" = pkg/test_calc.py && grep -q test_add pkg/test_calc.py");
        let feedback = runner
            .run(&task(), &record(), Some("def test_add(): ..."))
            .await
            .unwrap();
        assert!(feedback.overall_pass);
    }

    #[tokio::test]
    async fn shell_runner_timeout_is_an_environment_error() {
        let runner = ShellTestRunner::new("sleep 5").with_timeout(Duration::from_millis(50));
        let err = runner.run(&task(), &record(), None).await.unwrap_err();
        assert!(matches!(err, LoomError::ExecutionEnvironment { task: 4, .. }));
    }

    #[tokio::test]
    async fn syntax_failure_skips_the_tests() {
        let runner = ShellTestRunner::new("touch ran_tests; exit 0")
            .with_syntax_check("echo 'line 1: unexpected indent' >&2; exit 1");
        let feedback = runner.run(&task(), &record(), None).await.unwrap();
        assert!(!feedback.structurally_valid);
        assert!(!feedback.overall_pass);
        assert!(feedback.tests.is_empty());
        assert_eq!(feedback.syntax_errors, vec!["line 1: unexpected indent".to_string()]);
        assert_eq!(feedback.failure_kind(Default::default()), Some(codeloom_types::FailureKind::Syntax));
    }

    #[tokio::test]
    async fn passing_syntax_check_runs_the_tests() {
        let runner = ShellTestRunner::new("exit 0").with_syntax_check("test -s \"$CODELOOM_FILE\"");
        let feedback = runner.run(&task(), &record(), None).await.unwrap();
        assert!(feedback.overall_pass);
        assert_eq!(feedback.tests.len(), 1);
    }

    #[tokio::test]
    async fn agent_plan_round_trip() {
        let response = r#"{"tasks":[{"target_file":"calc.py","description":"add"}],"files":[]}"#;
        let mut agent = AgentCommand::new("sh");
        agent.args = vec!["-c".into(), format!("cat >/dev/null; echo '{}'", response)];
        let plan = agent.plan("calculator").await.unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].target_file, "calc.py");
    }

    #[tokio::test]
    async fn agent_with_large_output_and_request_completes() {
        let response = r#"{"tasks":[{"target_file":"calc.py","description":"add"}],"files":[]}"#;
        let mut agent = AgentCommand::new("sh").with_timeout(Duration::from_secs(5));
        agent.args = vec![
            "-c".into(),
            format!(
                "head -c 200000 /dev/zero | tr '\\0' x >&2; cat >/dev/null; echo '{}'",
                response
            ),
        ];
        let requirements = "r".repeat(200_000);
        let plan = tokio::time::timeout(Duration::from_secs(10), agent.plan(&requirements))
            .await
            .expect("agent call hung")
            .unwrap();
        assert_eq!(plan.tasks.len(), 1);
    }

    #[tokio::test]
    async fn agent_that_ignores_its_input_still_answers() {
        let response = r#"{"tasks":[{"target_file":"calc.py","description":"add"}],"files":[]}"#;
        let mut agent = AgentCommand::new("sh");
        agent.args = vec!["-c".into(), format!("echo '{}'", response)];
        let plan = agent.plan(&"r".repeat(200_000)).await.unwrap();
        assert_eq!(plan.tasks[0].target_file, "calc.py");
    }

    #[tokio::test]
    async fn agent_timeout_covers_the_request_write() {
        let mut agent = AgentCommand::new("sh").with_timeout(Duration::from_millis(200));
        agent.args = vec!["-c".into(), "sleep 5".into()];
        let err = tokio::time::timeout(Duration::from_secs(4), agent.plan(&"r".repeat(200_000)))
            .await
            .expect("agent call hung")
            .unwrap_err();
        assert!(matches!(err, LoomError::Planning(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn agent_failure_maps_to_generation_error() {
        let mut agent = AgentCommand::new("sh");
        agent.args = vec!["-c".into(), "cat >/dev/null; exit 1".into()];
        let err = agent.generate(&task(), "", None).await.unwrap_err();
        assert!(matches!(err, LoomError::Generation { task: 4, .. }));
    }

    #[tokio::test]
    async fn unchecked_runner_always_passes() {
        let feedback = UncheckedRunner.run(&task(), &record(), None).await.unwrap();
        assert!(feedback.overall_pass);
        assert!(feedback.tests.is_empty());
    }
}
