//! Tool handlers backed by external programs.
//!
//! [`ToolCommand`] runs a program with a timeout and captured output;
//! [`CommandTool`] adapts a configured command line template into a
//! [`ToolHandler`] by staging the input in a temporary directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;

use tm_core::config::CommandSpec;
use tm_core::{Error, Result, ToolId, ToolOptions};

use crate::tools::{ProgressSink, ToolHandler, ToolInput, ToolOutput};

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// ToolCommand
// ---------------------------------------------------------------------------

/// Output captured from a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// A builder for one external program invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    /// `label` names the tool in error messages.
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Run to completion, failing with [`Error::Tool`] on spawn errors,
    /// timeouts and non-zero exits.
    pub async fn execute(&self) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            tool = %self.label,
            program = %self.program.display(),
            args = ?self.args,
            "Running tool command"
        );

        let child = cmd
            .spawn()
            .map_err(|e| Error::tool(&self.label, format!("failed to spawn: {e}")))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let output = CommandOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                if !output.status.success() {
                    return Err(Error::tool(
                        &self.label,
                        format!("exited with status {}: {}", output.status, output.stderr.trim()),
                    ));
                }
                Ok(output)
            }
            Ok(Err(e)) => Err(Error::tool(
                &self.label,
                format!("I/O error waiting for process: {e}"),
            )),
            // The child is killed when its future is dropped.
            Err(_elapsed) => Err(Error::tool(
                &self.label,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandTool
// ---------------------------------------------------------------------------

/// [`ToolHandler`] that shells out to a configured program.
pub struct CommandTool {
    tool: ToolId,
    spec: CommandSpec,
}

impl CommandTool {
    pub fn new(tool: ToolId, spec: CommandSpec) -> Self {
        Self { tool, spec }
    }

    /// Substitute `{input}`, `{output}` and `{option:<key>}` in one argument.
    fn expand_arg(
        &self,
        template: &str,
        input: &Path,
        output: &Path,
        options: &ToolOptions,
    ) -> Result<String> {
        let arg = template
            .replace("{input}", &input.to_string_lossy())
            .replace("{output}", &output.to_string_lossy());

        let mut expanded = String::with_capacity(arg.len());
        let mut rest = arg.as_str();
        while let Some(start) = rest.find("{option:") {
            let after = &rest[start + "{option:".len()..];
            let Some(end) = after.find('}') else {
                break;
            };
            let key = &after[..end];
            let value = match options.get(key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => {
                    return Err(Error::tool(
                        self.tool.as_str(),
                        format!("missing option '{key}'"),
                    ))
                }
                Some(other) => other.to_string(),
            };
            expanded.push_str(&rest[..start]);
            expanded.push_str(&value);
            rest = &after[end + 1..];
        }
        expanded.push_str(rest);
        Ok(expanded)
    }

    fn output_name(&self, input_name: &str) -> String {
        let path = Path::new(input_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".into());
        let ext = self
            .spec
            .output_extension
            .clone()
            .or_else(|| path.extension().map(|e| e.to_string_lossy().to_string()));
        match ext {
            Some(ext) => format!("{stem}.{}", ext.trim_start_matches('.')),
            None => stem,
        }
    }
}

/// Strip directory components so a client-supplied name stays in the
/// staging directory.
fn staging_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "input".into())
}

#[async_trait]
impl ToolHandler for CommandTool {
    fn name(&self) -> &str {
        self.tool.as_str()
    }

    async fn execute(
        &self,
        input: &ToolInput,
        options: &ToolOptions,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        let workdir = tempfile::Builder::new().prefix("tm-tool-").tempdir()?;
        let input_path = workdir.path().join(staging_name(&input.name));
        let output_name = self.output_name(&input.name);
        let output_path = workdir.path().join(format!("out-{}", staging_name(&output_name)));

        tokio::fs::write(&input_path, &input.data).await?;
        progress.report(10);

        let args = self
            .spec
            .args
            .iter()
            .map(|a| self.expand_arg(a, &input_path, &output_path, options))
            .collect::<Result<Vec<_>>>()?;

        ToolCommand::new(self.tool.as_str(), &self.spec.program)
            .args(args)
            .timeout(Duration::from_secs(self.spec.timeout_secs.max(1)))
            .execute()
            .await?;
        progress.report(90);

        let data = tokio::fs::read(&output_path).await.map_err(|e| {
            Error::tool(self.tool.as_str(), format!("no output produced: {e}"))
        })?;
        progress.report(100);

        Ok(ToolOutput::new(output_name, data))
    }
}
