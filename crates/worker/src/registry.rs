//! 已安装任务注册表
//!
//! key是任务的唯一身份；重复安装一律先删后装（替换语义），保证同一key
//! 至多一份活动安装。计划任务按CRON规则触发，常驻任务退出即重启，
//! 一次性任务受超时约束，超时即终止并回传TimedOut。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::runner::JobRunner;
use capd_core::{CapError, CapResult};
use capd_domain::{CallbackSink, JobCallback, JobEventKind, JobSpec};

/// 常驻任务退出后的重启间隔
const DAEMON_RESTART_DELAY: Duration = Duration::from_secs(1);

struct InstalledJob {
    kind_label: &'static str,
    running: Arc<AtomicBool>,
    run_now: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// 单个Worker的任务安装注册表
pub struct JobRegistry {
    address: String,
    runner: JobRunner,
    jobs: RwLock<HashMap<String, InstalledJob>>,
}

impl JobRegistry {
    pub fn new(address: String, sink: Arc<dyn CallbackSink>) -> Self {
        Self {
            runner: JobRunner::new(address.clone(), sink),
            address,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 安装计划任务
    pub async fn set_cron(
        &self,
        key: &str,
        rule: &str,
        spec: &JobSpec,
        callback: &JobCallback,
    ) -> CapResult<()> {
        let schedule = Schedule::from_str(rule).map_err(|e| CapError::InvalidCron {
            expr: rule.to_string(),
            message: e.to_string(),
        })?;

        self.delete(key).await;

        let running = Arc::new(AtomicBool::new(false));
        let run_now = Arc::new(Notify::new());
        let handle = tokio::spawn(cron_loop(
            self.runner.clone(),
            key.to_string(),
            schedule,
            spec.clone(),
            callback.clone(),
            running.clone(),
            run_now.clone(),
        ));

        self.insert(key, "cron", running, run_now, handle).await;
        info!("已安装计划任务: key={key}, rule={rule}");
        Ok(())
    }

    /// 安装常驻任务
    pub async fn set_daemon(
        &self,
        key: &str,
        spec: &JobSpec,
        callback: &JobCallback,
    ) -> CapResult<()> {
        self.delete(key).await;

        let running = Arc::new(AtomicBool::new(false));
        let run_now = Arc::new(Notify::new());
        let handle = tokio::spawn(daemon_loop(
            self.runner.clone(),
            key.to_string(),
            spec.clone(),
            callback.clone(),
            running.clone(),
        ));

        self.insert(key, "daemon", running, run_now, handle).await;
        info!("已安装常驻任务: key={key}");
        Ok(())
    }

    /// 安装一次性任务，立即开始执行
    pub async fn set_oneshot(
        &self,
        key: &str,
        spec: &JobSpec,
        callback: &JobCallback,
        run_timeout: Duration,
    ) -> CapResult<()> {
        self.delete(key).await;

        let running = Arc::new(AtomicBool::new(false));
        let run_now = Arc::new(Notify::new());
        let handle = tokio::spawn(oneshot_loop(
            self.runner.clone(),
            key.to_string(),
            spec.clone(),
            callback.clone(),
            run_timeout,
            running.clone(),
            run_now.clone(),
        ));

        self.insert(key, "task", running, run_now, handle).await;
        info!("已安装一次性任务: key={key}, timeout={}s", run_timeout.as_secs());
        Ok(())
    }

    async fn insert(
        &self,
        key: &str,
        kind_label: &'static str,
        running: Arc<AtomicBool>,
        run_now: Arc<Notify>,
        handle: JoinHandle<()>,
    ) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(
            key.to_string(),
            InstalledJob {
                kind_label,
                running,
                run_now,
                handle,
            },
        );
    }

    /// 移除安装；key不存在时为无操作，返回是否真的移除了
    pub async fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut jobs = self.jobs.write().await;
            jobs.remove(key)
        };
        match removed {
            Some(job) => {
                job.handle.abort();
                debug!("已移除{}任务: key={key}", job.kind_label);
                true
            }
            None => false,
        }
    }

    /// key下是否存在安装
    pub async fn get(&self, key: &str) -> bool {
        self.jobs.read().await.contains_key(key)
    }

    /// 立即触发一次执行
    pub async fn run_now(&self, key: &str) -> CapResult<()> {
        let jobs = self.jobs.read().await;
        match jobs.get(key) {
            Some(job) => {
                job.run_now.notify_one();
                Ok(())
            }
            None => Err(CapError::remote_execution(format!("未找到安装: {key}"))),
        }
    }

    /// 任务当前是否在执行中
    pub async fn is_running(&self, key: &str) -> bool {
        let jobs = self.jobs.read().await;
        jobs.get(key)
            .map(|job| job.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn installed_keys(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    /// 终止全部安装（进程退出前调用）
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.write().await;
        for (key, job) in jobs.drain() {
            job.handle.abort();
            debug!("关闭时终止任务: key={key}");
        }
    }
}

/// 执行一轮任务规格并回传Started/Finished事件
async fn execute_once(
    runner: &JobRunner,
    key: &str,
    callback: &JobCallback,
    spec: &JobSpec,
    running: &AtomicBool,
) {
    running.store(true, Ordering::SeqCst);
    runner.emit(key, callback, JobEventKind::Started).await;
    let outcome = runner.run(key, callback, spec).await;
    if !outcome.success {
        warn!("任务执行失败: key={key}, error={:?}", outcome.error);
    }
    runner
        .emit(
            key,
            callback,
            JobEventKind::Finished {
                success: outcome.success,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error: outcome.error,
            },
        )
        .await;
    running.store(false, Ordering::SeqCst);
}

async fn cron_loop(
    runner: JobRunner,
    key: String,
    schedule: Schedule,
    spec: JobSpec,
    callback: JobCallback,
    running: Arc<AtomicBool>,
    run_now: Arc<Notify>,
) {
    loop {
        let Some(next) = schedule.after(&Utc::now()).next() else {
            warn!("计划任务无下一次触发时间,退出调度: key={key}");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = sleep(wait) => {}
            _ = run_now.notified() => {
                debug!("计划任务被立即触发: key={key}");
            }
        }
        execute_once(&runner, &key, &callback, &spec, &running).await;
    }
}

async fn daemon_loop(
    runner: JobRunner,
    key: String,
    spec: JobSpec,
    callback: JobCallback,
    running: Arc<AtomicBool>,
) {
    loop {
        execute_once(&runner, &key, &callback, &spec, &running).await;
        sleep(DAEMON_RESTART_DELAY).await;
    }
}

async fn oneshot_loop(
    runner: JobRunner,
    key: String,
    spec: JobSpec,
    callback: JobCallback,
    run_timeout: Duration,
    running: Arc<AtomicBool>,
    run_now: Arc<Notify>,
) {
    execute_with_timeout(&runner, &key, &callback, &spec, run_timeout, &running).await;
    // 留在注册表中等待可能的重复触发
    loop {
        run_now.notified().await;
        execute_with_timeout(&runner, &key, &callback, &spec, run_timeout, &running).await;
    }
}

async fn execute_with_timeout(
    runner: &JobRunner,
    key: &str,
    callback: &JobCallback,
    spec: &JobSpec,
    run_timeout: Duration,
    running: &AtomicBool,
) {
    running.store(true, Ordering::SeqCst);
    runner.emit(key, callback, JobEventKind::Started).await;
    match timeout(run_timeout, runner.run(key, callback, spec)).await {
        Ok(outcome) => {
            runner
                .emit(
                    key,
                    callback,
                    JobEventKind::Finished {
                        success: outcome.success,
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        error: outcome.error,
                    },
                )
                .await;
        }
        Err(_) => {
            warn!("一次性任务超时: key={key}, timeout={}s", run_timeout.as_secs());
            runner.emit(key, callback, JobEventKind::TimedOut).await;
        }
    }
    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use capd_domain::{JobEvent, JobStep};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<JobEvent>>,
    }

    #[async_trait]
    impl CallbackSink for RecordingSink {
        async fn deliver(&self, event: JobEvent) -> CapResult<()> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    impl RecordingSink {
        async fn finished_events(&self) -> Vec<JobEvent> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|e| matches!(e.kind, JobEventKind::Finished { .. }))
                .cloned()
                .collect()
        }
    }

    fn echo_spec(text: &str) -> JobSpec {
        JobSpec::new(vec![JobStep::Shell {
            command: format!("echo {text}"),
            cwd: None,
        }])
    }

    async fn wait_until<F, Fut>(mut probe: F, deadline: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if probe().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn registry_with_sink() -> (Arc<JobRegistry>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(JobRegistry::new("127.0.0.1".to_string(), sink.clone()));
        (registry, sink)
    }

    #[tokio::test]
    async fn test_oneshot_runs_immediately_and_reports() {
        let (registry, sink) = registry_with_sink();
        registry
            .set_oneshot("job-1", &echo_spec("done"), &JobCallback::Noop, Duration::from_secs(30))
            .await
            .unwrap();

        let ok = wait_until(
            || {
                let sink = sink.clone();
                async move { !sink.finished_events().await.is_empty() }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(ok, "一次性任务未在限期内完成");

        let finished = sink.finished_events().await;
        match &finished[0].kind {
            JobEventKind::Finished { success, stdout, .. } => {
                assert!(success);
                assert!(stdout.contains("done"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oneshot_timeout_emits_timed_out() {
        let (registry, sink) = registry_with_sink();
        let spec = JobSpec::new(vec![JobStep::Shell {
            command: "sleep 30".to_string(),
            cwd: None,
        }]);
        registry
            .set_oneshot("job-slow", &spec, &JobCallback::Noop, Duration::from_millis(100))
            .await
            .unwrap();

        let ok = wait_until(
            || {
                let sink = sink.clone();
                async move {
                    sink.events
                        .lock()
                        .await
                        .iter()
                        .any(|e| matches!(e.kind, JobEventKind::TimedOut))
                }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(ok, "未收到TimedOut事件");
    }

    #[tokio::test]
    async fn test_replace_on_set_keeps_single_install() {
        let (registry, _) = registry_with_sink();
        registry
            .set_cron("cron-1", "0 0 0 1 1 *", &echo_spec("a"), &JobCallback::Noop)
            .await
            .unwrap();
        registry
            .set_cron("cron-1", "0 0 0 1 1 *", &echo_spec("b"), &JobCallback::Noop)
            .await
            .unwrap();

        assert!(registry.get("cron-1").await);
        assert_eq!(registry.installed_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_cron_rule_rejected() {
        let (registry, _) = registry_with_sink();
        let err = registry
            .set_cron("cron-bad", "not a rule", &echo_spec("x"), &JobCallback::Noop)
            .await
            .unwrap_err();
        assert!(matches!(err, CapError::InvalidCron { .. }));
        assert!(!registry.get("cron-bad").await);
    }

    #[tokio::test]
    async fn test_delete_removes_install() {
        let (registry, _) = registry_with_sink();
        registry
            .set_cron("cron-2", "0 0 0 1 1 *", &echo_spec("x"), &JobCallback::Noop)
            .await
            .unwrap();
        assert!(registry.delete("cron-2").await);
        assert!(!registry.get("cron-2").await);
        // 再次删除为无操作
        assert!(!registry.delete("cron-2").await);
    }

    #[tokio::test]
    async fn test_run_now_triggers_cron_job() {
        let (registry, sink) = registry_with_sink();
        // 规则指向远期，只有run_now能触发
        registry
            .set_cron("cron-3", "0 0 0 1 1 *", &echo_spec("manual"), &JobCallback::Noop)
            .await
            .unwrap();
        registry.run_now("cron-3").await.unwrap();

        let ok = wait_until(
            || {
                let sink = sink.clone();
                async move { !sink.finished_events().await.is_empty() }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(ok, "run_now未触发执行");
    }

    #[tokio::test]
    async fn test_run_now_unknown_key_is_error() {
        let (registry, _) = registry_with_sink();
        assert!(registry.run_now("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_daemon_restarts_and_reports_running() {
        let (registry, sink) = registry_with_sink();
        registry
            .set_daemon("daemon-1", &echo_spec("tick"), &JobCallback::Noop)
            .await
            .unwrap();

        // 常驻任务退出后会被重启，应累计出多次Finished
        let ok = wait_until(
            || {
                let sink = sink.clone();
                async move { sink.finished_events().await.len() >= 2 }
            },
            Duration::from_secs(10),
        )
        .await;
        assert!(ok, "常驻任务未重启");
        registry.delete("daemon-1").await;
    }
}
