//! Agent 登记表
//!
//! 进程内所有 Agent 的起停和查询入口。每个基站 id 至多一个
//! Agent；启动先占位再初始化，保证并发启动同一基站只会成功一个。

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{Agent, AgentOps};
use crate::config::AgentConfig;
use crate::error::{SendError, StartError};
use crate::proto::ActionKind;
use crate::sched::Job;
use crate::{net, sched};

/// 一个运行中 Agent 的句柄
struct AgentHandle {
    agent: Arc<Agent>,
    net_task: JoinHandle<()>,
    sched_task: JoinHandle<()>,
}

enum Slot {
    /// 已占位，`init` 还在进行
    Reserved,
    Running(AgentHandle),
}

/// Agent 登记表
pub struct AgentRegistry {
    config: AgentConfig,
    agents: Mutex<HashMap<u32, Slot>>,
}

impl AgentRegistry {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// 启动一个基站的 Agent。必须在 tokio 运行时内调用。
    ///
    /// `init` 回调在表锁外执行，失败时回收占位，不留半成品。
    pub fn start(&self, enb_id: u32, ops: Arc<dyn AgentOps>) -> Result<(), StartError> {
        {
            let mut agents = self.agents.lock();
            if agents.contains_key(&enb_id) {
                return Err(StartError::DuplicateAgent(enb_id));
            }
            agents.insert(enb_id, Slot::Reserved);
        }

        if let Err(e) = ops.init() {
            self.agents.lock().remove(&enb_id);
            return Err(StartError::Init(e));
        }

        // 先起调度循环再起网络循环，连接建立时调度器已经在收任务
        let agent = Agent::new(enb_id, self.config.clone(), ops);
        let handle = AgentHandle {
            sched_task: tokio::spawn(sched::sched_loop(agent.clone())),
            net_task: tokio::spawn(net::net_loop(agent.clone())),
            agent,
        };
        self.agents.lock().insert(enb_id, Slot::Running(handle));

        info!("🚀 Agent 启动: enb={}", enb_id);
        Ok(())
    }

    /// 停掉一个基站的 Agent；返回是否确有其人
    pub async fn terminate(&self, enb_id: u32) -> bool {
        let handle = {
            let mut agents = self.agents.lock();
            match agents.remove(&enb_id) {
                Some(Slot::Running(handle)) => handle,
                Some(Slot::Reserved) => {
                    // 启动还没完成，占位放回去
                    agents.insert(enb_id, Slot::Reserved);
                    return false;
                }
                None => return false,
            }
        };

        self.teardown(handle).await;
        true
    }

    /// 停掉全部 Agent，逐个摘下逐个收尾
    pub async fn stop(&self) {
        loop {
            let handle = {
                let mut agents = self.agents.lock();
                let id = agents
                    .iter()
                    .find_map(|(id, slot)| matches!(slot, Slot::Running(_)).then_some(*id));
                match id {
                    Some(id) => match agents.remove(&id) {
                        Some(Slot::Running(handle)) => Some(handle),
                        _ => None,
                    },
                    None => None,
                }
            };

            match handle {
                Some(handle) => self.teardown(handle).await,
                None => break,
            }
        }
    }

    /// 把一帧交给指定 Agent 发往控制器。帧会进调度队列尽快发出，
    /// 序列号由发送路径填写，调用方留空即可。
    pub fn send(&self, enb_id: u32, frame: Vec<u8>) -> Result<(), SendError> {
        let agent = self
            .agent_of(enb_id)
            .ok_or(SendError::UnknownAgent(enb_id))?;
        agent.sched.post(Job::send(frame))
    }

    /// 指定基站当前是否连着控制器
    pub fn is_connected(&self, enb_id: u32) -> bool {
        self.agent_of(enb_id).map_or(false, |a| a.is_connected())
    }

    /// 指定基站是否存在某种订阅；`instance` 为 `None` 时忽略实例号
    pub fn has_trigger(&self, enb_id: u32, kind: ActionKind, instance: Option<u32>) -> bool {
        self.agent_of(enb_id)
            .map_or(false, |a| a.triggers.has(kind, instance))
    }

    fn agent_of(&self, enb_id: u32) -> Option<Arc<Agent>> {
        match self.agents.lock().get(&enb_id) {
            Some(Slot::Running(handle)) => Some(handle.agent.clone()),
            _ => None,
        }
    }

    /// 收尾顺序固定：释放回调、清订阅、停网络循环、停调度循环
    async fn teardown(&self, handle: AgentHandle) {
        let agent = handle.agent;

        if let Err(e) = agent.ops.release() {
            warn!("释放回调失败: enb={} err={}", agent.enb_id, e);
        }
        agent.triggers.flush();

        agent.net.stop.store(true, Ordering::Release);
        if handle.net_task.await.is_err() {
            warn!("网络任务异常退出: enb={}", agent.enb_id);
        }

        agent.sched.stop.store(true, Ordering::Release);
        if handle.sched_task.await.is_err() {
            warn!("调度任务异常退出: enb={}", agent.enb_id);
        }

        info!("👋 Agent 停止: enb={}", agent.enb_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoopOps;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fast_config() -> AgentConfig {
        AgentConfig {
            ctrl_addr: "127.0.0.1".to_string(),
            ctrl_port: 1, // 无人监听，连接立刻被拒
            poll_interval: Duration::from_millis(20),
            reconnect_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
            sched_interval: Duration::from_millis(20),
            hello_interval: Duration::from_millis(100),
        }
    }

    #[derive(Default)]
    struct LifecycleOps {
        inits: AtomicUsize,
        releases: AtomicUsize,
    }

    impl AgentOps for LifecycleOps {
        fn init(&self) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingInit;

    impl AgentOps for FailingInit {
        fn init(&self) -> anyhow::Result<()> {
            Err(anyhow!("协议栈没起来"))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_is_exclusive_per_enb() {
        let registry = AgentRegistry::new(fast_config());

        registry.start(1, Arc::new(NoopOps)).unwrap();
        assert!(matches!(
            registry.start(1, Arc::new(NoopOps)),
            Err(StartError::DuplicateAgent(1))
        ));

        // 不同基站互不影响
        registry.start(2, Arc::new(NoopOps)).unwrap();
        registry.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_init_frees_the_slot() {
        let registry = AgentRegistry::new(fast_config());

        assert!(matches!(
            registry.start(1, Arc::new(FailingInit)),
            Err(StartError::Init(_))
        ));

        // 占位已回收，同一 id 可以重来
        registry.start(1, Arc::new(NoopOps)).unwrap();
        registry.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lifecycle_callbacks_run_once() {
        let ops = Arc::new(LifecycleOps::default());
        let registry = AgentRegistry::new(fast_config());

        registry.start(7, ops.clone()).unwrap();
        assert_eq!(ops.inits.load(Ordering::SeqCst), 1);

        assert!(registry.terminate(7).await);
        assert_eq!(ops.releases.load(Ordering::SeqCst), 1);

        // 已经停了，再停是 no-op
        assert!(!registry.terminate(7).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queries_on_unknown_agent() {
        let registry = AgentRegistry::new(fast_config());

        assert!(matches!(
            registry.send(99, vec![0u8; 21]),
            Err(SendError::UnknownAgent(99))
        ));
        assert!(!registry.is_connected(99));
        assert!(!registry.has_trigger(99, ActionKind::UeReport, None));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_enqueues_without_connection() {
        let registry = AgentRegistry::new(fast_config());
        registry.start(3, Arc::new(NoopOps)).unwrap();

        // 没连上也能入队，发送失败由调度器处理
        registry
            .send(3, crate::proto::enb_setup_request(3, 1))
            .unwrap();

        registry.stop().await;
    }
}
