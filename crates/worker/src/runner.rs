//! 任务规格执行器
//!
//! 按序解释步骤；shell步骤经 `sh -c` 执行并全量捕获输出，非零退出码
//! 一律判为失败并中止后续步骤。采样与轮询结果即时通过回调通道上报。

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{sampler, vcs};
use capd_domain::{CallbackSink, JobCallback, JobEvent, JobEventKind, JobSpec, JobStep, RepoKind};

/// 一次任务执行的汇总结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// 在Worker本机解释执行任务规格
#[derive(Clone)]
pub struct JobRunner {
    address: String,
    sink: Arc<dyn CallbackSink>,
}

impl JobRunner {
    pub fn new(address: String, sink: Arc<dyn CallbackSink>) -> Self {
        Self { address, sink }
    }

    /// 依次执行全部步骤；首个失败步骤终止执行
    pub async fn run(&self, key: &str, callback: &JobCallback, spec: &JobSpec) -> RunOutcome {
        let mut stdout_all = String::new();
        let mut stderr_all = String::new();

        for step in &spec.steps {
            if let Err(message) = self
                .run_step(key, callback, step, &mut stdout_all, &mut stderr_all)
                .await
            {
                stderr_all.push_str(&message);
                stderr_all.push('\n');
                return RunOutcome {
                    success: false,
                    stdout: stdout_all,
                    stderr: stderr_all,
                    error: Some(message),
                };
            }
        }

        RunOutcome {
            success: true,
            stdout: stdout_all,
            stderr: stderr_all,
            error: None,
        }
    }

    async fn run_step(
        &self,
        key: &str,
        callback: &JobCallback,
        step: &JobStep,
        stdout_all: &mut String,
        stderr_all: &mut String,
    ) -> Result<(), String> {
        match step {
            JobStep::CleanDir { path } => {
                self.shell(&format!("rm -rf {path}"), None, stdout_all, stderr_all)
                    .await?;
            }
            JobStep::MakeDir { path } => {
                self.shell(&format!("mkdir -p {path}"), None, stdout_all, stderr_all)
                    .await?;
            }
            JobStep::Checkout {
                kind,
                url,
                username,
                password,
                version,
                dest,
            } => {
                let command = vcs::checkout_command(*kind, url, username, password, version, dest);
                self.shell(&command, None, stdout_all, stderr_all).await?;
            }
            JobStep::Shell { command, cwd } => {
                self.shell(command, cwd.as_deref(), stdout_all, stderr_all)
                    .await?;
            }
            JobStep::SampleResources => {
                let sample = sampler::collect();
                self.emit(key, callback, JobEventKind::Sample(sample)).await;
            }
            JobStep::PollCommits {
                kind,
                url,
                username,
                password,
                mirror_dir,
                limit,
            } => {
                self.poll_commits(
                    key, callback, *kind, url, username, password, mirror_dir, *limit, stdout_all,
                    stderr_all,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// 轮询一轮提交历史并上报
    #[allow(clippy::too_many_arguments)]
    async fn poll_commits(
        &self,
        key: &str,
        callback: &JobCallback,
        kind: RepoKind,
        url: &str,
        username: &str,
        password: &str,
        mirror_dir: &str,
        limit: usize,
        stdout_all: &mut String,
        stderr_all: &mut String,
    ) -> Result<(), String> {
        if kind == RepoKind::Git {
            let git_dir = format!("{mirror_dir}/{}/.git", vcs::CODE_DIR);
            let sync_command = if Path::new(&git_dir).exists() {
                vcs::update_mirror_command(mirror_dir)
            } else {
                vcs::clone_mirror_command(url, username, password, mirror_dir)
            };
            self.logged_shell(key, callback, &sync_command, stdout_all, stderr_all)
                .await?;
        }

        let history_command = vcs::history_command(kind, url, username, password, mirror_dir, limit);
        let history = self
            .logged_shell(key, callback, &history_command, stdout_all, stderr_all)
            .await?;

        let commits = match kind {
            RepoKind::Git => vcs::parse_git_log(&history),
            RepoKind::Svn => vcs::parse_svn_log(&history),
        };
        self.emit(
            key,
            callback,
            JobEventKind::LogLine(format!(
                "获取到{}条{}提交记录",
                commits.len(),
                kind.as_str()
            )),
        )
        .await;
        self.emit(key, callback, JobEventKind::Commits(commits)).await;
        Ok(())
    }

    /// 执行shell命令并把命令与输出逐行上报到轮询日志
    async fn logged_shell(
        &self,
        key: &str,
        callback: &JobCallback,
        command: &str,
        stdout_all: &mut String,
        stderr_all: &mut String,
    ) -> Result<String, String> {
        self.emit(key, callback, JobEventKind::LogLine(format!("命令: {command}")))
            .await;
        let result = self.shell(command, None, stdout_all, stderr_all).await;
        match &result {
            Ok(output) => {
                self.emit(
                    key,
                    callback,
                    JobEventKind::LogLine(format!("执行结果(stdout): {}", output.trim_end())),
                )
                .await;
            }
            Err(message) => {
                self.emit(key, callback, JobEventKind::LogLine(message.clone()))
                    .await;
            }
        }
        result
    }

    /// 执行单条shell命令，返回其stdout；非零退出码返回Err
    async fn shell(
        &self,
        command: &str,
        cwd: Option<&str>,
        stdout_all: &mut String,
        stderr_all: &mut String,
    ) -> Result<String, String> {
        debug!("执行命令: {command}");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("启动命令失败: {command}: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        stdout_all.push_str(&stdout);
        stderr_all.push_str(&stderr);

        if output.status.success() {
            Ok(stdout)
        } else {
            Err(format!(
                "命令{}执行返回码{:?},正常情况下shell命令应返回0",
                command,
                output.status.code()
            ))
        }
    }

    pub(crate) async fn emit(&self, key: &str, callback: &JobCallback, kind: JobEventKind) {
        let event = JobEvent::new(
            self.address.clone(),
            key.to_string(),
            callback.clone(),
            kind,
        );
        if let Err(e) = self.sink.deliver(event).await {
            warn!("回传事件失败: key={key}, error={e}");
        }
    }
}
