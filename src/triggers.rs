//! 触发器（订阅）登记表
//!
//! 控制器通过 Trigger 族消息订阅周期性上报；每个 Agent 维护一张
//! 订阅表，记录哪些 (模块, 事件种类, 实例) 组合当前有效。调度器
//! 执行触发器任务前先回查此表，退订后残留的任务因此自然失效。

use parking_lot::Mutex;
use tracing::debug;

use crate::proto::ActionKind;

/// 一条订阅记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// 表内唯一 id
    pub id: u32,
    /// 发起订阅的控制器模块
    pub module: u32,
    /// 事件种类
    pub kind: ActionKind,
    /// 同种事件的实例区分（UE 测量用 measure_id，其余为 0）
    pub instance: u32,
    /// 订阅时控制器发来的原始请求帧，订阅存续期间随时可回查
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Table {
    next_id: u32,
    entries: Vec<Trigger>,
}

/// 每个 Agent 一份的订阅表
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    inner: Mutex<Table>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记订阅，返回其 id。
    ///
    /// 以 (module, kind, instance) 为键幂等：重复订阅返回已有记录的
    /// id，原有 payload 不动，不产生第二条记录。
    pub fn add(&self, module: u32, kind: ActionKind, instance: u32, payload: &[u8]) -> u32 {
        // 拷贝在锁外做，锁内只有链表操作
        let payload = payload.to_vec();
        let mut table = self.inner.lock();

        if let Some(existing) = table
            .entries
            .iter()
            .find(|t| t.module == module && t.kind == kind && t.instance == instance)
        {
            return existing.id;
        }

        table.next_id = table.next_id.wrapping_add(1);
        let id = table.next_id;
        table.entries.push(Trigger {
            id,
            module,
            kind,
            instance,
            payload,
        });

        debug!("📌 登记订阅 id={} module={} kind={:?} instance={}", id, module, kind, instance);
        id
    }

    /// 按键退订，返回被摘掉那条的 id；不存在时返回 `None`
    pub fn del(&self, module: u32, kind: ActionKind, instance: u32) -> Option<u32> {
        let mut table = self.inner.lock();
        let at = table
            .entries
            .iter()
            .position(|t| t.module == module && t.kind == kind && t.instance == instance)?;
        Some(table.entries.remove(at).id)
    }

    /// 按 id 查找（调度器执行触发器任务前的有效性回查）
    pub fn find(&self, id: u32) -> Option<Trigger> {
        self.inner.lock().entries.iter().find(|t| t.id == id).cloned()
    }

    /// 是否存在某种订阅；`instance` 为 `None` 时忽略实例号
    pub fn has(&self, kind: ActionKind, instance: Option<u32>) -> bool {
        self.inner.lock().entries.iter().any(|t| {
            t.kind == kind && instance.map_or(true, |i| t.instance == i)
        })
    }

    /// 清空全表（断链和停机时调用）
    pub fn flush(&self) {
        let mut table = self.inner.lock();
        if !table.entries.is_empty() {
            debug!("🧹 清空 {} 条订阅", table.entries.len());
            table.entries.clear();
        }
    }
}
