//! Agent 核心
//!
//! 把一个基站的全部运行态（连接状态、调度器、订阅表、技术层回调）
//! 组合成一个 `Agent`。网络循环和调度循环都拿着同一个 `Arc<Agent>`
//! 协作，登记表负责起停这两个循环。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::AgentConfig;
use crate::proto::{HandoverReq, UeMeasureReq};
use crate::sched::Scheduler;
use crate::triggers::TriggerRegistry;

/// 技术层回调
///
/// 协议侧收到控制器请求后，通过这组回调通知底层协议栈。所有方法
/// 都有空实现缺省，调用方只覆盖自己关心的事件即可。回调失败只记
/// 日志，不会影响连接（网络错误才会）。
///
/// 回调在调度循环里执行，实现方不要在里面长时间阻塞。
pub trait AgentOps: Send + Sync {
    /// Agent 启动时调用一次；返回错误会使 `start` 整体失败
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Agent 销毁时调用一次
    fn release(&self) -> Result<()> {
        Ok(())
    }

    /// 与控制器的连接断开（含主动断开和网络错误）
    fn disconnected(&self) -> Result<()> {
        Ok(())
    }

    /// 控制器查询基站能力
    fn enb_setup_request(&self, module: u32) -> Result<()> {
        let _ = module;
        Ok(())
    }

    /// 控制器查询小区能力
    fn cell_setup_request(&self, module: u32, cell_id: u16) -> Result<()> {
        let _ = (module, cell_id);
        Ok(())
    }

    /// 控制器订阅 UE 接入/离开上报
    fn ue_report(&self, module: u32, trigger_id: u32) -> Result<()> {
        let _ = (module, trigger_id);
        Ok(())
    }

    /// 控制器订阅 UE 无线测量
    fn ue_measure(&self, module: u32, trigger_id: u32, req: UeMeasureReq) -> Result<()> {
        let _ = (module, trigger_id, req);
        Ok(())
    }

    /// 控制器订阅 MAC 层状态上报
    fn mac_report(&self, module: u32, trigger_id: u32, interval: u16) -> Result<()> {
        let _ = (module, trigger_id, interval);
        Ok(())
    }

    /// 控制器要求把 UE 切换到目标小区
    fn handover_ue(&self, module: u32, source_cell: u16, ho: HandoverReq) -> Result<()> {
        let _ = (module, source_cell, ho);
        Ok(())
    }
}

/// 全空实现，守护进程和测试用
#[derive(Debug, Default)]
pub struct NoopOps;

impl AgentOps for NoopOps {}

/// 连接侧共享状态
///
/// 读半边由网络循环独占持有，不进这里；写半边给发送路径共享。
#[derive(Debug, Default)]
pub struct NetContext {
    /// 是否已与控制器建立连接。断链清理流程里它最后翻转，
    /// 保证外部观察到 false 时队列和订阅表已经清空。
    connected: AtomicBool,
    /// 出方向序列号，发送前最后一刻写入帧里
    seq: AtomicU32,
    /// TCP 写半边；None 表示当前没有连接
    pub writer: AsyncMutex<Option<OwnedWriteHalf>>,
    /// 网络循环停止标志
    pub stop: AtomicBool,
    /// 断链清理进行中（防止网络循环和调度级联同时清理）
    pub teardown: AtomicBool,
}

impl NetContext {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Release);
    }

    /// 下一个出方向序列号；每个连接纪元从 0 发起
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// 断链后序列号从头开始
    pub fn reset_seq(&self) {
        self.seq.store(0, Ordering::Relaxed);
    }
}

/// 一个基站的 Agent 运行态
pub struct Agent {
    /// 基站 id
    pub enb_id: u32,
    pub config: AgentConfig,
    pub ops: Arc<dyn AgentOps>,
    pub net: NetContext,
    pub sched: Scheduler,
    pub triggers: TriggerRegistry,
}

impl Agent {
    pub fn new(enb_id: u32, config: AgentConfig, ops: Arc<dyn AgentOps>) -> Arc<Self> {
        Arc::new(Self {
            enb_id,
            config,
            ops,
            net: NetContext::default(),
            sched: Scheduler::new(),
            triggers: TriggerRegistry::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.net.is_connected()
    }
}
