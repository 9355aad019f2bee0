//! Guest agent operations: commands, files, filesystem freeze and the
//! lambda command.

use std::sync::Arc;

use guestvisor_shared::{GuestvisorError, GuestvisorResult, ResultExt};

use super::VirtGuest;
use crate::bot::ExecOutput;
use crate::models::Status;

impl VirtGuest {
    /// Run `cmd` through the guest agent without taking the host lock.
    pub async fn execute_command(&self, cmd: &[String]) -> GuestvisorResult<ExecOutput> {
        if cmd.is_empty() {
            return Err(GuestvisorError::InvalidArgument("empty command".into()));
        }

        let session = self.open_bot(true).await?;
        let bot = Arc::clone(session.bot());
        let result = async {
            let state = bot.state().await.context("get domain state")?;
            if !state.is_running() {
                return Err(GuestvisorError::InvalidState(format!(
                    "guest {} is {}, not running",
                    self.meta.id, state
                )));
            }
            bot.execute_command(cmd).await.context("execute command")
        }
        .await;
        session.finish().await;
        result
    }

    /// Read a file inside the guest.
    pub async fn cat(&self, path: &str) -> GuestvisorResult<Vec<u8>> {
        self.require_status(&[Status::Running], "cat")?;
        let (session, bot) = self.locked_bot().await?;
        let result = bot
            .read_file(path)
            .await
            .with_context(|| format!("read {}", path));
        session.finish().await;
        result
    }

    /// The last `n` lines of a file inside the guest. A lambda guest answers
    /// with its command output instead.
    pub async fn log(&self, path: &str, n: usize) -> GuestvisorResult<Vec<u8>> {
        if let Some(lambda) = &self.meta.lambda {
            return Ok(lambda.output.clone());
        }
        let content = self.cat(path).await?;
        Ok(tail(&content, n).to_vec())
    }

    /// Write `content` to `dest` inside the guest.
    pub async fn copy_to_guest(&self, dest: &str, content: &[u8], overwrite: bool) -> GuestvisorResult<()> {
        self.require_status(&[Status::Running], "copy")?;
        let (session, bot) = self.locked_bot().await?;
        let result = bot
            .write_file(dest, content, overwrite)
            .await
            .with_context(|| format!("write {}", dest));
        session.finish().await;
        result
    }

    /// Freeze every guest filesystem, returning how many were frozen.
    pub async fn fs_freeze_all(&self) -> GuestvisorResult<u32> {
        let (session, bot) = self.locked_bot().await?;
        let result = bot.fs_freeze_all().await.context("fs freeze");
        session.finish().await;
        result
    }

    pub async fn fs_thaw_all(&self) -> GuestvisorResult<u32> {
        let (session, bot) = self.locked_bot().await?;
        let result = bot.fs_thaw_all().await.context("fs thaw");
        session.finish().await;
        result
    }

    pub async fn fs_freeze_status(&self) -> GuestvisorResult<String> {
        let (session, bot) = self.locked_bot().await?;
        let result = bot.fs_freeze_status().await.context("fs freeze status");
        session.finish().await;
        result
    }

    /// Hypervisor UUID of the domain.
    pub async fn uuid(&self) -> GuestvisorResult<String> {
        let (session, bot) = self.locked_bot().await?;
        let result = bot.uuid().await.context("get uuid");
        session.finish().await;
        result
    }

    /// Run the lambda command and keep its result on the record. Guests
    /// without a lambda, or whose lambda reads stdin, are skipped.
    pub async fn run_lambda(&mut self) -> GuestvisorResult<()> {
        if self.meta.lambda_stdin {
            return Ok(());
        }
        let Some(cmd) = self.meta.lambda.as_ref().map(|l| l.cmd.clone()) else {
            return Ok(());
        };

        let out = self.execute_command(&cmd).await.context("run lambda")?;
        tracing::info!(guest_id = %self.meta.id, exit_code = out.exit_code, pid = out.pid, "Lambda finished");
        if let Some(lambda) = self.meta.lambda.as_mut() {
            lambda.output = out.output;
            lambda.exit_code = out.exit_code;
            lambda.pid = out.pid;
        }
        self.save()
    }
}

/// The last `n` lines of `content`; a trailing newline does not count as an
/// empty last line.
fn tail(content: &[u8], n: usize) -> &[u8] {
    if n == 0 {
        return &[];
    }
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    let start = body
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, b)| **b == b'\n')
        .nth(n - 1)
        .map(|(i, _)| i + 1)
        .unwrap_or(0);
    &content[start..]
}
