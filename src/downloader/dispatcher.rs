use std::collections::HashSet;

use super::registry::TaskRegistry;
use super::task::{TaskId, TaskStatus};
use crate::engine::EngineHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchKind {
    // 从未提交给引擎，需要获取链接后新建
    Fresh,
    // 引擎里已经有这个任务，排队等到名额后直接恢复
    Resume(EngineHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub kind: DispatchKind,
}

/// 调度策略：并发上限内按创建顺序（FIFO）挑选等待中的任务
///
/// 每次触发都重新扫描任务表，不单独维护运行计数。
pub struct Dispatcher {
    max_concurrent: usize,
}

impl Dispatcher {
    pub const MIN_CONCURRENT: usize = 1;
    pub const MAX_CONCURRENT: usize = 3;

    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: Self::clamp(max_concurrent),
        }
    }

    pub fn clamp(value: usize) -> usize {
        value.clamp(Self::MIN_CONCURRENT, Self::MAX_CONCURRENT)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 返回是否调高了上限（调高会空出名额）
    pub fn set_max_concurrent(&mut self, value: usize) -> bool {
        let value = Self::clamp(value);
        let raised = value > self.max_concurrent;
        self.max_concurrent = value;
        raised
    }

    pub fn free_slots(&self, registry: &TaskRegistry) -> usize {
        self.max_concurrent.saturating_sub(registry.busy_count())
    }

    /// 挑选本轮可以启动的任务
    ///
    /// `in_flight` 中的任务还有未返回的引擎提交调用，不能重复提交。
    pub fn select(&self, registry: &TaskRegistry, in_flight: &HashSet<TaskId>) -> Vec<Dispatch> {
        let free = self.free_slots(registry);
        if free == 0 {
            return Vec::new();
        }

        registry
            .active()
            .filter(|t| t.status == TaskStatus::Waiting && !in_flight.contains(&t.id))
            .take(free)
            .map(|t| Dispatch {
                task_id: t.id,
                kind: match &t.engine_handle {
                    Some(handle) => DispatchKind::Resume(handle.clone()),
                    None => DispatchKind::Fresh,
                },
            })
            .collect()
    }
}
