//! External collaborators: the config validator and the text normalization filter
//!
//! Both are traits so tests can substitute deterministic fakes. The production
//! implementations spawn subprocesses via `tokio::process`.

use crate::error::SyncError;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Checks the whole on-disk configuration tree.
///
/// Implementations must only read the tree; concurrent checks from different
/// domains are allowed. Checks run on spawned commit tasks, hence `'static`.
pub trait ConfigValidator: Send + Sync + 'static {
    /// `Ok(())` if the tree is valid, [`SyncError::Validation`] otherwise
    fn check(&self) -> impl Future<Output = Result<(), SyncError>> + Send;
}

impl<T: ConfigValidator> ConfigValidator for Arc<T> {
    fn check(&self) -> impl Future<Output = Result<(), SyncError>> + Send {
        (**self).check()
    }
}

/// Rewrites rendered text into its normalized form.
///
/// On error, `output` may hold partial data; callers discard it.
pub trait TextNormalizer: Send + Sync {
    fn normalize(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

impl<T: TextNormalizer> TextNormalizer for Arc<T> {
    fn normalize(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send {
        (**self).normalize(input, output)
    }
}

/// Split a command line such as `"nginx -t"` into program and arguments
fn split_command(line: &str) -> Result<(String, Vec<String>), SyncError> {
    let mut words = shell_words::split(line)
        .map_err(|e| SyncError::Config(format!("cannot parse command {:?}: {}", line, e)))?;
    if words.is_empty() {
        return Err(SyncError::Config("command must not be empty".to_string()));
    }
    let program = words.remove(0);
    Ok((program, words))
}

/// Validator that runs an executable and trusts its exit status
#[derive(Debug, Clone)]
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandValidator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// Build from a shell-style command line
    pub fn from_command_line(line: &str) -> Result<Self, SyncError> {
        let (program, args) = split_command(line)?;
        Ok(Self::new(program, args))
    }

    /// A check that has not finished after `timeout` counts as a rejection
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self) -> Result<(), SyncError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(SyncError::Validation {
                        output: format!("{} did not finish within {:?}", self.program, limit),
                    })
                }
            },
            None => cmd.output().await,
        };

        // A validator that cannot run cannot vouch for the tree
        let output = output.map_err(|e| SyncError::Validation {
            output: format!("failed to run {}: {}", self.program, e),
        })?;

        if output.status.success() {
            debug!(program = %self.program, "Configuration check passed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        Err(SyncError::Validation {
            output: format!("{} exited with {}: {}", self.program, output.status, detail),
        })
    }
}

impl ConfigValidator for CommandValidator {
    async fn check(&self) -> Result<(), SyncError> {
        self.run().await
    }
}

/// Normalizer that pipes text through an external filter (stdin to stdout)
#[derive(Debug, Clone)]
pub struct CommandNormalizer {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandNormalizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn from_command_line(line: &str) -> Result<Self, SyncError> {
        let (program, args) = split_command(line)?;
        Ok(Self::new(program, args))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn failure(&self, message: String) -> SyncError {
        SyncError::Subprocess {
            program: self.program.clone(),
            message,
        }
    }

    async fn pipe(&self, input: &[u8], output: &mut Vec<u8>) -> Result<(), SyncError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(format!("spawn: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.failure("stdin not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.failure("stdout not captured".to_string()))?;

        // Feed and drain concurrently so a large body cannot fill both pipes.
        // Dropping stdin at the end of the block signals EOF to the filter.
        let feed = async move {
            stdin.write_all(input).await?;
            stdin.flush().await
        };
        let (fed, read) = tokio::join!(feed, stdout.read_to_end(output));
        let status = child
            .wait()
            .await
            .map_err(|e| self.failure(format!("wait: {}", e)))?;

        fed.map_err(|e| self.failure(format!("write stdin: {}", e)))?;
        read.map_err(|e| self.failure(format!("read stdout: {}", e)))?;
        if !status.success() {
            return Err(self.failure(format!("exited with {}", status)));
        }
        Ok(())
    }
}

impl TextNormalizer for CommandNormalizer {
    async fn normalize(&self, input: &[u8], output: &mut Vec<u8>) -> Result<(), SyncError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.pipe(input, output))
                .await
                .map_err(|_| self.failure(format!("no output within {:?}", limit)))?,
            None => self.pipe(input, output).await,
        }
    }
}

/// In-process normalizer: blank-only lines are emptied and runs of them
/// collapse to a single empty line.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqueezeBlankLines;

impl SqueezeBlankLines {
    pub fn squeeze(input: &[u8], output: &mut Vec<u8>) {
        let (body, trailing_newline) = match input.strip_suffix(b"\n") {
            Some(body) => (body, true),
            None => (input, false),
        };
        if body.is_empty() && !trailing_newline {
            return;
        }

        let mut prev_blank = false;
        let mut first = true;
        for line in body.split(|b| *b == b'\n') {
            let blank = line.iter().all(|b| b.is_ascii_whitespace());
            if blank && prev_blank {
                continue;
            }
            if !first {
                output.push(b'\n');
            }
            first = false;
            if !blank {
                output.extend_from_slice(line);
            }
            prev_blank = blank;
        }
        if trailing_newline {
            output.push(b'\n');
        }
    }
}

impl TextNormalizer for SqueezeBlankLines {
    async fn normalize(&self, input: &[u8], output: &mut Vec<u8>) -> Result<(), SyncError> {
        Self::squeeze(input, output);
        Ok(())
    }
}

/// The normalizer chosen by configuration
#[derive(Debug, Clone)]
pub enum CleanupFilter {
    Command(CommandNormalizer),
    Builtin(SqueezeBlankLines),
}

impl TextNormalizer for CleanupFilter {
    async fn normalize(&self, input: &[u8], output: &mut Vec<u8>) -> Result<(), SyncError> {
        match self {
            CleanupFilter::Command(cmd) => cmd.normalize(input, output).await,
            CleanupFilter::Builtin(squeeze) => squeeze.normalize(input, output).await,
        }
    }
}
