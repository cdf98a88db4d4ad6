use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use flowlord_api::{create_routes, AppState, ScheduleHandle};
use flowlord_core::config::AppConfig;
use flowlord_core::parse_duration;
use flowlord_dispatcher::scheduler::TaskSender;
use flowlord_dispatcher::{OrchestrationEngine, RetryScheduler, WorkflowRegistry};
use flowlord_domain::{Consumer, FileStat, Producer, Task, TaskStore, WorkflowStore};
use flowlord_infrastructure::{MemoryBus, Notifier, SqliteCache};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 协调器应用：装配缓存、注册表、调度、编排引擎与通知器
pub struct Application {
    config: AppConfig,
    cache: Arc<SqliteCache>,
    registry: Arc<WorkflowRegistry>,
    bus: MemoryBus,
    schedule: Arc<ScheduleHandle>,
    notifier: Arc<Notifier>,
    engine: Arc<OrchestrationEngine>,
    retry: Arc<RetryScheduler>,
    alerts_rx: std::sync::Mutex<Option<mpsc::Receiver<Task>>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let cache = Arc::new(
            SqliteCache::open(&config.cache)
                .await
                .context("打开任务状态缓存失败")?,
        );
        let bus = MemoryBus::new();
        let producer: Arc<dyn Producer> = Arc::new(bus.clone());

        let (alerts_tx, alerts_rx) = mpsc::channel(256);
        let sender = Arc::new(TaskSender {
            cache: Arc::clone(&cache) as Arc<dyn TaskStore>,
            producer: Arc::clone(&producer),
            alerts: alerts_tx,
        });

        let registry = Arc::new(WorkflowRegistry::new(
            &config.workflow.path,
            Some(Arc::clone(&cache) as Arc<dyn WorkflowStore>),
        ));
        let schedule = Arc::new(ScheduleHandle::new(
            Arc::clone(&sender),
            Arc::clone(&producer),
            config.workflow.path.clone(),
        ));
        let retry = Arc::new(RetryScheduler::new());
        let engine = Arc::new(OrchestrationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&sender),
            Arc::clone(&retry),
            config.bus.failed_topic.clone(),
        ));

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let report_addr = format!("{host}:{}", config.api.port);
        let notifier = Arc::new(Notifier::new(&config.notifier, Arc::clone(&cache), report_addr)?);

        Ok(Self {
            config,
            cache,
            registry,
            bus,
            schedule,
            notifier,
            engine,
            retry,
            alerts_rx: std::sync::Mutex::new(Some(alerts_rx)),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        // 首次加载：零工作流视为致命
        let outcome = self.registry.refresh().await;
        if !outcome.errors.is_empty() {
            warn!(errors = %outcome.errors, "部分工作流文件加载失败");
        }
        self.schedule
            .rebuild(&self.registry)
            .await
            .context("初始调度构建失败")?;
        info!(
            workflows = self.registry.snapshot().len(),
            "工作流加载完成"
        );

        let refresh_every = parse_duration(&self.config.workflow.refresh)
            .context("解析workflow.refresh失败")?
            .to_std()
            .context("workflow.refresh必须为正")?;

        let (stop_tx, _) = watch::channel(false);

        let alerts_rx = self
            .alerts_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("应用已经运行过")?;
        let alert_handle = self.notifier.start_alert_loop(alerts_rx);
        let summary_handle = self.notifier.start_summary_loop(stop_tx.subscribe());
        let retry_handle = Arc::clone(&self.retry)
            .run(Arc::clone(&self.schedule.sender), stop_tx.subscribe());

        let done_handle = self.spawn_done_consumer(stop_tx.subscribe())?;
        let files_handle = self.spawn_files_consumer(stop_tx.subscribe())?;
        let ticker_handle = self.spawn_tickers(refresh_every, stop_tx.subscribe());
        let http_handle = self.spawn_http(stop_tx.subscribe()).await?;

        let _ = shutdown.recv().await;
        info!("开始关闭应用组件");
        let _ = stop_tx.send(true);
        self.schedule.stop().await;

        // 告警通道由sender长期持有，消费循环只能中止
        alert_handle.abort();
        for handle in [Some(summary_handle), Some(retry_handle), Some(done_handle), files_handle, Some(ticker_handle)]
            .into_iter()
            .flatten()
        {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
        if let Some(handle) = http_handle {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }

        // 最后关库并回写备份
        self.cache.close().await.context("关闭任务状态缓存失败")?;
        info!("应用组件已全部关闭");
        Ok(())
    }

    fn spawn_done_consumer(&self, mut stop: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut consumer = self
            .bus
            .consumer(&self.config.bus.done_topic)
            .context("领取done主题消费端失败")?;
        let engine = Arc::clone(&self.engine);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    next = consumer.recv() => match next {
                        Ok(Some(task)) => {
                            if let Err(e) = engine.process(task).await {
                                warn!(error = %e, "任务事件处理失败");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "done主题消费失败");
                            break;
                        }
                    },
                }
            }
            info!("done消费循环退出");
        }))
    }

    fn spawn_files_consumer(
        &self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Option<JoinHandle<()>>> {
        if self.config.bus.files_topic.is_empty() {
            return Ok(None);
        }
        let mut consumer = self
            .bus
            .consumer(&self.config.bus.files_topic)
            .context("领取files主题消费端失败")?;
        let schedule = Arc::clone(&self.schedule);
        let cache = Arc::clone(&self.cache);
        Ok(Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    next = consumer.recv() => match next {
                        Ok(Some(task)) => handle_file_event(&schedule, &cache, &task).await,
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "files主题消费失败");
                            break;
                        }
                    },
                }
            }
            info!("files消费循环退出");
        })))
    }

    /// 周期性重载工作流 + 每日一次过期记录回收
    fn spawn_tickers(
        self: &Arc<Self>,
        refresh_every: std::time::Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(refresh_every);
            refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            refresh.tick().await;
            let mut recycle = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            recycle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            recycle.tick().await;

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = refresh.tick() => {
                        match app.schedule.refresh(&app.registry).await {
                            Ok(outcome) if !outcome.changed.is_empty() => {
                                info!(changed = ?outcome.changed, "工作流已热更新");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "周期重载失败"),
                        }
                    }
                    _ = recycle.tick() => {
                        let cutoff = Utc::now() - app.cache.retention;
                        match app.cache.recycle(cutoff).await {
                            Ok(n) => info!(deleted = n, "过期记录回收完成"),
                            Err(e) => warn!(error = %e, "过期记录回收失败"),
                        }
                    }
                }
            }
            info!("定时器循环退出");
        })
    }

    async fn spawn_http(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Option<JoinHandle<()>>> {
        let port = self.config.api.port;
        if port == 0 {
            return Ok(None);
        }
        let state = AppState {
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            schedule: Arc::clone(&self.schedule),
            notifier: Arc::clone(&self.notifier),
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let router = create_routes(state);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("绑定HTTP端口 {port} 失败"))?;
        info!(port, "HTTP管理接口已启动");
        Ok(Some(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP服务异常退出");
            }
        })))
    }
}

/// 文件到达事件：载荷优先按FileStat JSON解析，裸字符串按路径处理
async fn handle_file_event(schedule: &ScheduleHandle, cache: &SqliteCache, event: &Task) {
    let stat = FileStat::from_json(event.info.as_bytes()).unwrap_or_else(|_| FileStat {
        path: event.info.clone(),
        ..Default::default()
    });
    let matcher = schedule.matcher().await;
    match matcher.match_file(&stat).await {
        Ok(tasks) => {
            let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
            let names: Vec<String> = tasks.iter().map(|t| t.key()).collect();
            if let Err(e) = cache.add_file_message(&stat, &ids, &names).await {
                warn!(path = %stat.path, error = %e, "文件消息入库失败");
            }
        }
        Err(e) => warn!(path = %stat.path, error = %e, "文件事件未触发任务"),
    }
}
