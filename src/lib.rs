//! enb-agent - 嵌入式基站控制面 Agent
//!
//! 跑在 eNB 里的小代理：和远端控制器维持一条 TCP 连接，把控制器
//! 的请求转成对底层协议栈的回调，把协议栈的上报转成出方向帧。
//!
//! # 核心功能
//!
//! - **连接管理**: 无限重连 + keepalive，断链自动清理依附状态
//! - **任务调度**: 一次性/周期任务两级队列，网络错误级联作废连接
//! - **订阅表**: 控制器的周期上报订阅，幂等登记、退订即失效
//! - **登记表**: 多基站共存，每基站一个 Agent、两个循环任务
//!
//! # 用法
//!
//! 实现 [`AgentOps`]（全部方法都有空实现缺省），注册进
//! [`AgentRegistry`]，之后用 [`AgentRegistry::send`] 发帧、
//! 用查询接口看连接和订阅状态。

pub mod agent;
pub mod config;
pub mod error;
mod net;
pub mod proto;
pub mod registry;
pub mod sched;
pub mod triggers;

// Re-exports
pub use agent::{AgentOps, NoopOps};
pub use config::{AgentConfig, DEFAULT_CONFIG_FILE};
pub use error::{JobNotFound, SendError, StartError};
pub use proto::{ActionKind, Direction, FrameError, Header, MsgFamily, OpKind};
pub use registry::AgentRegistry;
pub use triggers::Trigger;
