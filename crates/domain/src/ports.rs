use async_trait::async_trait;
use flowlord_core::FlowlordResult;

use crate::phase::Workflow;
use crate::task::Task;

/// 任务总线生产端。topic即任务类型。
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, topic: &str, task: &Task) -> FlowlordResult<()>;
}

/// 任务总线消费端，每个实例绑定单个topic
#[async_trait]
pub trait Consumer: Send + Sync {
    /// 阻塞等待下一条任务，总线关闭时返回None
    async fn recv(&mut self) -> FlowlordResult<Option<Task>>;
}

/// 编排引擎写入任务状态用的最小存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn add(&self, task: &Task) -> FlowlordResult<()>;
}

/// 工作流镜像存储，注册表刷新时同步文件与phase清单
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_workflow(&self, name: &str, workflow: &Workflow) -> FlowlordResult<()>;
    async fn remove_workflow(&self, name: &str) -> FlowlordResult<()>;
}
