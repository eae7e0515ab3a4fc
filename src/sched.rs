//! 任务调度器
//!
//! 每个 Agent 一个调度循环：固定节拍醒来，把到期的任务取出执行。
//! 任务分两类：出方向发送（帧已组好，执行即发出）和入方向请求
//! （执行即调技术层回调）。周期任务靠 credits 续期，网络错误会
//! 级联成整条连接的清理。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{JobNotFound, SendError};
use crate::net;
use crate::proto::{self, Header};

/// 任务一次执行的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 执行完毕，任务丢弃
    Consumed,
    /// 执行完毕，按 delay 重新入队
    Reschedule,
    /// 还没到期，留到下一轮
    NotElapsed,
    /// 发送失败，整条连接作废
    NetworkError,
}

/// 任务种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// 发送一个已组好的帧
    Send,
    /// keepalive
    Hello,
    EnbSetup,
    CellSetup,
    UeReport,
    UeMeasure,
    MacReport,
    Handover,
}

/// 一个排队中的任务
#[derive(Debug)]
pub struct Job {
    /// 取消用的键（和 kind 一起）；订阅类任务用订阅 id，其余为 0
    pub id: u32,
    pub kind: JobKind,
    /// Send 任务装出方向帧，请求任务装收到的原帧
    pub payload: Vec<u8>,
    /// 订阅类任务回查订阅表用的 id
    pub trigger: Option<u32>,
    /// 到期延迟
    pub delay: Duration,
    /// 剩余续期次数；0 为一次性，-1 永久续期
    pub credits: i32,
    /// 入队（或上次续期）时刻
    pub issued: Instant,
}

impl Job {
    fn new(kind: JobKind, payload: Vec<u8>, delay: Duration, credits: i32) -> Self {
        Self {
            id: 0,
            kind,
            payload,
            trigger: None,
            delay,
            credits,
            issued: Instant::now(),
        }
    }

    /// 出方向发送任务，入队后尽快发出
    pub fn send(frame: Vec<u8>) -> Self {
        Self::new(JobKind::Send, frame, Duration::from_millis(1), 0)
    }

    /// keepalive 任务，连接存续期间永久续期
    pub fn hello(period: Duration) -> Self {
        Self::new(JobKind::Hello, Vec::new(), period, -1)
    }

    /// 入方向请求任务（一次性，尽快执行）
    pub fn request(kind: JobKind, frame: Vec<u8>) -> Self {
        Self::new(kind, frame, Duration::from_millis(1), 0)
    }

    /// 订阅类请求任务，带上回查用的订阅 id
    pub fn trigger_request(kind: JobKind, frame: Vec<u8>, trigger_id: u32) -> Self {
        let mut job = Self::new(kind, frame, Duration::from_millis(1), 0);
        job.id = trigger_id;
        job.trigger = Some(trigger_id);
        job
    }
}

#[derive(Debug, Default)]
struct Queues {
    /// 本轮待检查的任务
    ready: VecDeque<Job>,
    /// 本轮检查过但未到期（或刚续期）的任务
    deferred: Vec<Job>,
}

/// 每个 Agent 一份的调度器状态
#[derive(Debug, Default)]
pub struct Scheduler {
    queues: Mutex<Queues>,
    pub stop: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；调度器停止后拒收
    pub fn post(&self, job: Job) -> Result<(), SendError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(SendError::Stopped);
        }
        self.queues.lock().ready.push_back(job);
        Ok(())
    }

    /// 按键取消一个任务，两个队列都找。和执行路径抢同一把锁，
    /// 所以一个任务要么被执行一次，要么在执行前被摘走，不会两样都占。
    pub fn cancel(&self, id: u32, kind: JobKind) -> Result<(), JobNotFound> {
        let mut queues = self.queues.lock();

        if let Some(at) = queues.ready.iter().position(|j| j.id == id && j.kind == kind) {
            queues.ready.remove(at);
            return Ok(());
        }
        if let Some(at) = queues.deferred.iter().position(|j| j.id == id && j.kind == kind) {
            queues.deferred.remove(at);
            return Ok(());
        }

        Err(JobNotFound)
    }

    /// 当前排队任务总数
    pub fn pending(&self) -> usize {
        let queues = self.queues.lock();
        queues.ready.len() + queues.deferred.len()
    }

    /// 丢弃全部排队任务（断链清理和停机用）
    pub fn drain(&self) {
        let mut queues = self.queues.lock();
        let dropped = queues.ready.len() + queues.deferred.len();
        if dropped > 0 {
            debug!("🗑️ 丢弃 {} 个排队任务", dropped);
        }
        queues.ready.clear();
        queues.deferred.clear();
    }
}

/// 调度循环；`stop` 置位后退出并清空队列
pub(crate) async fn sched_loop(agent: Arc<Agent>) {
    debug!("调度循环启动: enb={}", agent.enb_id);

    while !agent.sched.stop.load(Ordering::Acquire) {
        consume(&agent).await;
        tokio::time::sleep(agent.config.sched_interval).await;
    }

    agent.sched.drain();
    debug!("调度循环退出: enb={}", agent.enb_id);
}

/// 跑完一轮：逐个弹出任务，到期的执行，没到期的留到下一轮。
/// 网络错误直接作废整条连接并提前结束本轮。
pub(crate) async fn consume(agent: &Arc<Agent>) {
    loop {
        let job = agent.sched.queues.lock().ready.pop_front();
        let Some(mut job) = job else {
            break;
        };

        let outcome = if job.issued.elapsed() < job.delay {
            Outcome::NotElapsed
        } else {
            perform_job(agent, &job).await
        };

        match outcome {
            Outcome::Consumed => {}
            Outcome::NotElapsed => {
                agent.sched.queues.lock().deferred.push(job);
            }
            Outcome::Reschedule => {
                if job.credits > 0 {
                    job.credits -= 1;
                }
                job.issued = Instant::now();
                agent.sched.queues.lock().deferred.push(job);
            }
            Outcome::NetworkError => {
                warn!("发送失败，作废与控制器的连接: enb={}", agent.enb_id);
                net::drop_connection(agent).await;
                return;
            }
        }
    }

    // 未到期的任务放回主队列
    let mut queues = agent.sched.queues.lock();
    while let Some(job) = queues.deferred.pop() {
        queues.ready.push_back(job);
    }
}

/// 执行一个到期任务
async fn perform_job(agent: &Arc<Agent>, job: &Job) -> Outcome {
    match job.kind {
        JobKind::Send => {
            if job.payload.len() > proto::MAX_FRAME_SIZE {
                warn!("帧超长 ({} 字节)，拒发", job.payload.len());
                return Outcome::Consumed;
            }
            match net::send_frame(agent, job.payload.clone()).await {
                Ok(()) => done(job),
                Err(_) => Outcome::NetworkError,
            }
        }

        JobKind::Hello => {
            let frame = proto::hello_request(agent.enb_id, job.delay.as_millis() as u32);
            match net::send_frame(agent, frame).await {
                Ok(()) => done(job),
                Err(_) => Outcome::NetworkError,
            }
        }

        JobKind::EnbSetup => invoke(job, |head| agent.ops.enb_setup_request(head.mod_id)),

        JobKind::CellSetup => {
            invoke(job, |head| agent.ops.cell_setup_request(head.mod_id, head.cell_id))
        }

        JobKind::Handover => invoke(job, |head| {
            let ho = proto::parse_handover(&job.payload)?;
            agent.ops.handover_ue(head.mod_id, head.cell_id, ho)
        }),

        JobKind::UeReport => invoke_trigger(agent, job, |head, trigger_id| {
            agent.ops.ue_report(head.mod_id, trigger_id)
        }),

        JobKind::UeMeasure => invoke_trigger(agent, job, |head, trigger_id| {
            let req = proto::parse_ue_measure(&job.payload)?;
            agent.ops.ue_measure(head.mod_id, trigger_id, req)
        }),

        JobKind::MacReport => invoke_trigger(agent, job, |head, trigger_id| {
            let interval = proto::parse_mac_report(&job.payload)?;
            agent.ops.mac_report(head.mod_id, trigger_id, interval)
        }),
    }
}

fn done(job: &Job) -> Outcome {
    if job.credits != 0 {
        Outcome::Reschedule
    } else {
        Outcome::Consumed
    }
}

/// 调技术层回调；回调失败只记日志，任务照常消耗
fn invoke<F>(job: &Job, f: F) -> Outcome
where
    F: FnOnce(&Header) -> anyhow::Result<()>,
{
    match Header::parse(&job.payload) {
        Ok(head) => {
            if let Err(e) = f(&head) {
                warn!("技术层回调失败 ({:?}): {}", job.kind, e);
            }
            done(job)
        }
        Err(e) => {
            warn!("任务帧解析失败 ({:?}): {}", job.kind, e);
            Outcome::Consumed
        }
    }
}

/// 订阅类任务先回查订阅表，退订后残留的任务直接丢弃
fn invoke_trigger<F>(agent: &Agent, job: &Job, f: F) -> Outcome
where
    F: FnOnce(&Header, u32) -> anyhow::Result<()>,
{
    let Some(id) = job.trigger else {
        return Outcome::Consumed;
    };
    if agent.triggers.find(id).is_none() {
        debug!("订阅 {} 已退订，跳过任务", id);
        return Outcome::Consumed;
    }
    invoke(job, |head| f(head, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOps, NoopOps};
    use crate::config::AgentConfig;
    use crate::proto::{ActionKind, OpKind};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingOps {
        setups: AtomicUsize,
        reports: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl AgentOps for CountingOps {
        fn enb_setup_request(&self, _module: u32) -> anyhow::Result<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn ue_report(&self, _module: u32, _trigger_id: u32) -> anyhow::Result<()> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnected(&self) -> anyhow::Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_agent(ops: Arc<dyn AgentOps>) -> Arc<Agent> {
        Agent::new(1, AgentConfig::default(), ops)
    }

    fn setup_job(delay_ms: u64, credits: i32) -> Job {
        let mut job = Job::request(JobKind::EnbSetup, proto::enb_setup_request(1, 7));
        job.delay = Duration::from_millis(delay_ms);
        job.credits = credits;
        job
    }

    #[tokio::test(start_paused = true)]
    async fn test_oneshot_runs_exactly_once_after_delay() {
        let ops = Arc::new(CountingOps::default());
        let agent = test_agent(ops.clone());

        agent.sched.post(setup_job(50, 0)).unwrap();

        // 未到期：不执行，任务保留
        consume(&agent).await;
        assert_eq!(ops.setups.load(Ordering::SeqCst), 0);
        assert_eq!(agent.sched.pending(), 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        consume(&agent).await;
        assert_eq!(ops.setups.load(Ordering::SeqCst), 1);
        assert_eq!(agent.sched.pending(), 0);

        // 再跑一轮不会重复执行
        consume(&agent).await;
        assert_eq!(ops.setups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credits_bound_repeat_count() {
        let ops = Arc::new(CountingOps::default());
        let agent = test_agent(ops.clone());

        // credits=2：共执行 3 次后消失
        agent.sched.post(setup_job(10, 2)).unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(15)).await;
            consume(&agent).await;
        }

        assert_eq!(ops.setups.load(Ordering::SeqCst), 3);
        assert_eq!(agent.sched.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forever_job_keeps_rescheduling() {
        let ops = Arc::new(CountingOps::default());
        let agent = test_agent(ops.clone());

        agent.sched.post(setup_job(10, -1)).unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(15)).await;
            consume(&agent).await;
        }

        assert_eq!(ops.setups.load(Ordering::SeqCst), 4);
        assert_eq!(agent.sched.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_cascades_into_teardown() {
        let ops = Arc::new(CountingOps::default());
        let agent = test_agent(ops.clone());

        // 状态标成已连接，但没有写半边：发送必然失败
        agent.net.set_connected(true);
        agent.triggers.add(1, ActionKind::UeReport, 0, &[]);

        agent.sched.post(Job::send(proto::enb_setup_request(1, 1))).unwrap();
        agent.sched.post(setup_job(5000, 0)).unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        consume(&agent).await;

        // 级联清理：队列清空、订阅清空、断开回调、状态翻回未连接
        assert_eq!(agent.sched.pending(), 0);
        assert!(!agent.triggers.has(ActionKind::UeReport, None));
        assert_eq!(ops.disconnects.load(Ordering::SeqCst), 1);
        assert!(!agent.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trigger_job_is_skipped() {
        let ops = Arc::new(CountingOps::default());
        let agent = test_agent(ops.clone());

        let frame = proto::ue_report_request(1, 4, OpKind::Add);
        let id = agent.triggers.add(4, ActionKind::UeReport, 0, &frame);
        agent
            .sched
            .post(Job::trigger_request(JobKind::UeReport, frame, id))
            .unwrap();

        // 任务执行前退订
        assert!(agent.triggers.del(4, ActionKind::UeReport, 0).is_some());

        tokio::time::advance(Duration::from_millis(5)).await;
        consume(&agent).await;

        assert_eq!(ops.reports.load(Ordering::SeqCst), 0);
        assert_eq!(agent.sched.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_key() {
        let ops = Arc::new(CountingOps::default());
        let agent = test_agent(ops.clone());

        let frame = proto::ue_report_request(1, 4, OpKind::Add);
        let id = agent.triggers.add(4, ActionKind::UeReport, 0, &frame);
        agent
            .sched
            .post(Job::trigger_request(JobKind::UeReport, frame, id))
            .unwrap();

        assert!(agent.sched.cancel(id, JobKind::UeReport).is_ok());
        assert_eq!(agent.sched.pending(), 0);

        // 取消过的任务不会执行
        tokio::time::advance(Duration::from_millis(5)).await;
        consume(&agent).await;
        assert_eq!(ops.reports.load(Ordering::SeqCst), 0);

        // 再取消一次报未找到
        assert_eq!(agent.sched.cancel(id, JobKind::UeReport), Err(JobNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_after_stop_is_rejected() {
        let agent = test_agent(Arc::new(NoopOps));
        agent.sched.stop.store(true, Ordering::Release);

        assert!(matches!(
            agent.sched.post(setup_job(1, 0)),
            Err(SendError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversize_send_is_dropped_without_teardown() {
        let agent = test_agent(Arc::new(NoopOps));
        agent.net.set_connected(true);

        let mut job = Job::send(vec![0u8; proto::MAX_FRAME_SIZE + 1]);
        job.delay = Duration::from_millis(1);
        agent.sched.post(job).unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        consume(&agent).await;

        // 超长帧只丢任务，不作废连接
        assert_eq!(agent.sched.pending(), 0);
        assert!(agent.is_connected());
    }
}
