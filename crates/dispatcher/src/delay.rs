use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowlord_domain::Task;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::scheduler::TaskSender;

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    // BinaryHeap是大顶堆，反序比较使到期最早的排在堆顶
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}

/// 延迟派发调度器。重试任务按到期时间入堆，由单个drain循环
/// 到点取出并重新派发，待处理数量对外可见。
pub struct RetryScheduler {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    pending: AtomicUsize,
    seq: AtomicU64,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            pending: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        }
    }

    /// 注册一条延迟任务，drain循环会在delay之后派发
    pub fn schedule(&self, task: Task, delay: Duration) {
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
        self.pending.fetch_add(1, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }

    /// 尚未到期派发的任务数
    pub fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::SeqCst)
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peek()
            .map(|e| e.due)
    }

    fn take_due(&self, now: Instant) -> Vec<Task> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while heap.peek().is_some_and(|e| e.due <= now) {
            if let Some(e) = heap.pop() {
                due.push(e.task);
            }
        }
        due
    }

    /// 启动drain循环，直到stop信号为true
    pub fn run(
        self: Arc<Self>,
        sender: Arc<TaskSender>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.next_due() {
                    None => {
                        tokio::select! {
                            _ = self.notify.notified() => {}
                            _ = stop.changed() => break,
                        }
                    }
                    Some(due) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(due) => {
                                for task in self.take_due(Instant::now()) {
                                    self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
                                    debug!(task_type = %task.task_type, id = %task.id, "重试任务到期派发");
                                    sender.send_or_alert(task).await;
                                }
                            }
                            // 新条目可能比当前堆顶更早到期
                            _ = self.notify.notified() => {}
                            _ = stop.changed() => break,
                        }
                    }
                }
            }
        })
    }
}
