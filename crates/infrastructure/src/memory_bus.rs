use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flowlord_core::{FlowlordError, FlowlordResult};
use flowlord_domain::{Consumer, Producer, Task};
use tokio::sync::mpsc;
use tracing::debug;

struct Channel {
    tx: mpsc::UnboundedSender<Task>,
    rx: Option<mpsc::UnboundedReceiver<Task>>,
}

/// 内存消息总线，单进程部署和测试用。
/// 每个topic一条无界通道，消费端按topic各自领取接收器。
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, Channel>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_channel<T>(&self, topic: &str, f: impl FnOnce(&mut Channel) -> T) -> T {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let channel = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Channel { tx, rx: Some(rx) }
        });
        f(channel)
    }

    /// 领取topic的消费端。每个topic只能领取一次。
    pub fn consumer(&self, topic: &str) -> FlowlordResult<MemoryConsumer> {
        let rx = self.with_channel(topic, |c| c.rx.take());
        match rx {
            Some(rx) => Ok(MemoryConsumer { rx }),
            None => Err(FlowlordError::bus(format!("topic {topic} 的消费端已被占用"))),
        }
    }
}

#[async_trait]
impl Producer for MemoryBus {
    async fn send(&self, topic: &str, task: &Task) -> FlowlordResult<()> {
        debug!(topic = %topic, task_type = %task.task_type, "发送任务到内存总线");
        self.with_channel(topic, |c| c.tx.send(task.clone()))
            .map_err(|e| FlowlordError::bus(format!("topic {topic} 发送失败: {e}")))
    }
}

pub struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<Task>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> FlowlordResult<Option<Task>> {
        Ok(self.rx.recv().await)
    }
}
