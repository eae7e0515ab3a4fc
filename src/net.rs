//! 控制器连接管理
//!
//! 每个 Agent 一个网络循环：连上控制器后收帧分发，断了就睡一段
//! 时间重连，永不放弃。读取带轮询超时，保证停止标志能在一个轮询
//! 周期内被看到。发送路径被调度器持有，序列号在写出前最后一刻
//! 写入帧里。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::proto::{
    self, ActionKind, Direction, FrameError, Header, MsgFamily, OpKind, HEADER_SIZE,
    MAX_FRAME_SIZE, PROLOGUE_SIZE,
};
use crate::sched::{Job, JobKind};

/// 网络循环；断线无限重连，`stop` 置位后退出
pub(crate) async fn net_loop(agent: Arc<Agent>) {
    let addr = agent.config.controller();
    debug!("网络循环启动: enb={} 控制器={}", agent.enb_id, addr);

    while !agent.net.stop.load(Ordering::Acquire) {
        let stream = match timeout(agent.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("连接控制器失败: {}", e);
                sleep(agent.config.reconnect_interval).await;
                continue;
            }
            Err(_) => {
                debug!("连接控制器超时: {}", addr);
                sleep(agent.config.reconnect_interval).await;
                continue;
            }
        };

        // 控制面消息小而杂，关 Nagle
        if let Err(e) = stream.set_nodelay(true) {
            warn!("设置 TCP_NODELAY 失败: {}", e);
        }

        let (mut reader, writer) = stream.into_split();
        *agent.net.writer.lock().await = Some(writer);
        agent.net.set_connected(true);
        info!("🔗 已连接控制器 {}: enb={}", addr, agent.enb_id);

        // 连接存续期间的 keepalive
        let _ = agent.sched.post(Job::hello(agent.config.hello_interval));

        serve_connection(&agent, &mut reader).await;
        drop_connection(&agent).await;

        if agent.net.stop.load(Ordering::Acquire) {
            break;
        }
        sleep(agent.config.reconnect_interval).await;
    }

    // 停止路径也可能带着活连接进来
    drop_connection(&agent).await;
    debug!("网络循环退出: enb={}", agent.enb_id);
}

enum ReadStatus {
    Full,
    Closed,
    Stopped,
}

/// 读满整个缓冲区；每次轮询都重查停止标志和连接状态。调度级联
/// 把连接作废后，读循环必须在一个轮询周期内退出来，不能抱着死
/// socket 等对端出错。
async fn read_full(
    agent: &Agent,
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
) -> std::io::Result<ReadStatus> {
    let mut filled = 0;

    while filled < buf.len() {
        if agent.net.stop.load(Ordering::Acquire)
            || agent.net.teardown.load(Ordering::Acquire)
            || !agent.net.is_connected()
        {
            return Ok(ReadStatus::Stopped);
        }

        match timeout(agent.config.poll_interval, reader.read(&mut buf[filled..])).await {
            Err(_) => continue,
            Ok(Ok(0)) => return Ok(ReadStatus::Closed),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
        }
    }

    Ok(ReadStatus::Full)
}

/// 收帧循环：长度前缀、负载、分发。任何帧错误都丢弃整条连接，
/// 不尝试重新对齐字节流。
async fn serve_connection(agent: &Arc<Agent>, reader: &mut OwnedReadHalf) {
    loop {
        let mut prologue = [0u8; PROLOGUE_SIZE];
        match read_full(agent, reader, &mut prologue).await {
            Ok(ReadStatus::Full) => {}
            Ok(ReadStatus::Stopped) => return,
            Ok(ReadStatus::Closed) => {
                info!("控制器关闭连接: enb={}", agent.enb_id);
                return;
            }
            Err(e) => {
                warn!("读取失败: {}", e);
                return;
            }
        }

        let len = u32::from_be_bytes(prologue) as usize;
        if len < HEADER_SIZE || len > MAX_FRAME_SIZE {
            warn!("非法帧长 {}，丢弃连接: enb={}", len, agent.enb_id);
            return;
        }

        let mut frame = vec![0u8; len];
        match read_full(agent, reader, &mut frame).await {
            Ok(ReadStatus::Full) => {}
            Ok(ReadStatus::Stopped) => return,
            Ok(ReadStatus::Closed) => {
                warn!("帧中途连接关闭: enb={}", agent.enb_id);
                return;
            }
            Err(e) => {
                warn!("读取失败: {}", e);
                return;
            }
        }

        if let Err(e) = dispatch(agent, frame) {
            warn!("帧解析失败，丢弃连接: enb={} err={}", agent.enb_id, e);
            return;
        }
    }
}

/// 按消息族分发一个入方向帧。实际工作都转成调度任务，收帧路径
/// 只做解析和登记，不直接调回调。
fn dispatch(agent: &Arc<Agent>, frame: Vec<u8>) -> Result<(), FrameError> {
    // 旧连接纪元的帧不许再进来：级联清理一旦开始，整帧丢弃，
    // 不能往刚清空的队列和订阅表里塞东西
    if agent.net.teardown.load(Ordering::Acquire) || !agent.net.is_connected() {
        debug!("连接已作废，丢弃入方向帧: enb={}", agent.enb_id);
        return Ok(());
    }

    let head = Header::parse(&frame)?;
    let (action, dir, op) = proto::event_info(&frame)?;

    if dir == Direction::Reply {
        debug!("忽略应答帧: action={:?} seq={}", action, head.seq);
        return Ok(());
    }

    match head.family {
        MsgFamily::Single => match action {
            ActionKind::EnbSetup => post_request(agent, JobKind::EnbSetup, frame, head.seq),
            ActionKind::CellSetup => post_request(agent, JobKind::CellSetup, frame, head.seq),
            ActionKind::Handover => {
                // 正文先验一遍，坏帧在这里就拒掉
                proto::parse_handover(&frame)?;
                post_request(agent, JobKind::Handover, frame, head.seq);
            }
            _ => debug!("忽略一次性事件: {:?}", action),
        },

        // 周期族目前只有 hello，而 hello 只有出方向有意义
        MsgFamily::Schedule => debug!("忽略周期事件: {:?}", action),

        MsgFamily::Trigger => match action {
            ActionKind::UeReport => subscribe(agent, JobKind::UeReport, action, 0, op, frame),
            ActionKind::UeMeasure => {
                let instance = proto::parse_ue_measure(&frame)?.measure_id as u32;
                subscribe(agent, JobKind::UeMeasure, action, instance, op, frame);
            }
            ActionKind::MacReport => {
                proto::parse_mac_report(&frame)?;
                subscribe(agent, JobKind::MacReport, action, 0, op, frame);
            }
            _ => debug!("忽略订阅事件: {:?}", action),
        },
    }

    Ok(())
}

/// 入方向请求转成调度任务，以来帧的序列号做任务键
fn post_request(agent: &Agent, kind: JobKind, frame: Vec<u8>, seq: u32) {
    let mut job = Job::request(kind, frame);
    job.id = seq;
    if agent.sched.post(job).is_err() {
        debug!("调度器已停止，丢弃请求: {:?}", kind);
    }
}

/// 处理订阅/退订：维护订阅表，订阅时再排一个通知技术层的任务
fn subscribe(
    agent: &Agent,
    kind: JobKind,
    action: ActionKind,
    instance: u32,
    op: OpKind,
    frame: Vec<u8>,
) {
    let head = match Header::parse(&frame) {
        Ok(h) => h,
        Err(_) => return,
    };

    match op {
        OpKind::Add => {
            let id = agent.triggers.add(head.mod_id, action, instance, &frame);
            if agent.sched.post(Job::trigger_request(kind, frame, id)).is_err() {
                debug!("调度器已停止，丢弃订阅任务: {:?}", kind);
            }
        }
        OpKind::Rem => {
            // 退订连带取消还没执行的订阅任务
            if let Some(id) = agent.triggers.del(head.mod_id, action, instance) {
                let _ = agent.sched.cancel(id, kind);
            }
        }
        other => debug!("忽略订阅操作 {:?}: {:?}", other, action),
    }
}

/// 发送一帧：写入序列号、长度前缀，然后整帧写出。没有连接或写
/// 失败都算网络错误，由调用方级联处理。
pub(crate) async fn send_frame(agent: &Agent, mut frame: Vec<u8>) -> Result<()> {
    proto::stamp_seq(&mut frame, agent.net.next_seq())?;

    let mut writer = agent.net.writer.lock().await;
    let Some(writer) = writer.as_mut() else {
        bail!("连接未建立");
    };

    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// 作废当前连接并清掉依附其上的所有状态。
///
/// 顺序固定：关写半边、清任务队列、清订阅表、通知技术层、序列号
/// 归零，最后才把连接状态翻回未连接。外部看到未连接时，残余状态
/// 一定已经清理完毕。
pub(crate) async fn drop_connection(agent: &Arc<Agent>) {
    if !agent.net.is_connected() {
        return;
    }
    // 网络循环和调度级联可能同时走到这里，只放一个进来
    if agent
        .net
        .teardown
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    agent.net.writer.lock().await.take();
    agent.sched.drain();
    agent.triggers.flush();

    if let Err(e) = agent.ops.disconnected() {
        warn!("断开回调失败: {}", e);
    }

    agent.net.reset_seq();
    agent.net.set_connected(false);
    agent.net.teardown.store(false, Ordering::Release);

    info!("🔌 与控制器断开: enb={}", agent.enb_id);
}
