//! 错误类型定义

use thiserror::Error;

/// `start` 失败原因
#[derive(Error, Debug)]
pub enum StartError {
    /// 同一基站 id 的 Agent 已经在运行
    #[error("基站 {0} 的 Agent 已在运行")]
    DuplicateAgent(u32),

    /// 技术层 `init` 回调失败（唯一致命的启动错误，所有部分状态会被回收）
    #[error("技术层初始化失败: {0}")]
    Init(#[source] anyhow::Error),
}

/// 按键取消任务时没有找到匹配项。交给调用方判断，不算故障。
#[derive(Error, Debug, PartialEq, Eq)]
#[error("没有匹配的排队任务")]
pub struct JobNotFound;

/// `send` 失败原因
#[derive(Error, Debug)]
pub enum SendError {
    /// 目标基站没有对应的 Agent
    #[error("基站 {0} 没有对应的 Agent")]
    UnknownAgent(u32),

    /// Agent 的调度器正在停止，不再接受新任务
    #[error("调度器已停止")]
    Stopped,
}
