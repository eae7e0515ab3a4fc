//! 线上协议编解码
//!
//! 帧格式：4 字节大端长度前缀 + 负载。负载以 18 字节主头开始，
//! 随后是 3 字节事件子头，最后是各消息自己的正文。多字节字段一律大端。
//!
//! 主头布局（偏移 / 字段）：
//! `0 family:u8 | 1 vers:u8 | 2 enb_id:u32 | 6 cell_id:u16 | 8 mod_id:u32 |
//!  12 length:u16 | 14 seq:u32`
//!
//! 连接管理只依赖主头提取路由信息（family、mod、cell、seq），
//! 正文解码推迟到任务执行时。

use thiserror::Error;

/// 长度前缀大小
pub const PROLOGUE_SIZE: usize = 4;
/// 主头大小
pub const HEADER_SIZE: usize = 18;
/// 事件子头大小
pub const EVENT_HEADER_SIZE: usize = 3;
/// 正文起始偏移
pub const BODY_OFFSET: usize = HEADER_SIZE + EVENT_HEADER_SIZE;
/// 序列号在主头中的偏移
pub const SEQ_OFFSET: usize = 14;
/// 协议版本
pub const PROTO_VERS: u8 = 1;
/// 单帧上限；超过即视为帧错误（入方向）或拒发（出方向）
pub const MAX_FRAME_SIZE: usize = 4096;

/// 帧级错误，一律按连接错误处理：丢弃连接重连，不做重新同步
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("帧截断: 需要 {need} 字节, 实际 {have}")]
    Truncated { need: usize, have: usize },

    #[error("协议版本不匹配: {0}")]
    Version(u8),

    #[error("帧超长: {0} 字节")]
    Oversize(usize),

    #[error("未知消息族: {0}")]
    UnknownFamily(u8),
}

/// 消息族（主头 family 字段），决定分发到哪个处理器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFamily {
    /// 一次性事件
    Single,
    /// 周期事件
    Schedule,
    /// 订阅（触发器）事件
    Trigger,
}

impl MsgFamily {
    pub fn from_u8(raw: u8) -> Result<Self, FrameError> {
        match raw {
            1 => Ok(MsgFamily::Single),
            2 => Ok(MsgFamily::Schedule),
            3 => Ok(MsgFamily::Trigger),
            other => Err(FrameError::UnknownFamily(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MsgFamily::Single => 1,
            MsgFamily::Schedule => 2,
            MsgFamily::Trigger => 3,
        }
    }
}

/// 事件种类（事件子头 type 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Invalid,
    Hello,
    EnbSetup,
    CellSetup,
    UeReport,
    UeMeasure,
    MacReport,
    Handover,
}

impl ActionKind {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ActionKind::Hello,
            2 => ActionKind::EnbSetup,
            3 => ActionKind::CellSetup,
            4 => ActionKind::UeReport,
            5 => ActionKind::UeMeasure,
            6 => ActionKind::MacReport,
            7 => ActionKind::Handover,
            _ => ActionKind::Invalid,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ActionKind::Invalid => 0,
            ActionKind::Hello => 1,
            ActionKind::EnbSetup => 2,
            ActionKind::CellSetup => 3,
            ActionKind::UeReport => 4,
            ActionKind::UeMeasure => 5,
            ActionKind::MacReport => 6,
            ActionKind::Handover => 7,
        }
    }
}

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Reply,
}

impl Direction {
    pub fn from_u8(raw: u8) -> Self {
        if raw == 0 {
            Direction::Request
        } else {
            Direction::Reply
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Direction::Request => 0,
            Direction::Reply => 1,
        }
    }
}

/// 操作类型（订阅消息用 Add/Rem 区分订阅与退订）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Unspecified,
    Success,
    Fail,
    NotSupported,
    Add,
    Rem,
}

impl OpKind {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => OpKind::Success,
            2 => OpKind::Fail,
            3 => OpKind::NotSupported,
            4 => OpKind::Add,
            5 => OpKind::Rem,
            _ => OpKind::Unspecified,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpKind::Unspecified => 0,
            OpKind::Success => 1,
            OpKind::Fail => 2,
            OpKind::NotSupported => 3,
            OpKind::Add => 4,
            OpKind::Rem => 5,
        }
    }
}

/// 主头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub family: MsgFamily,
    pub vers: u8,
    pub enb_id: u32,
    pub cell_id: u16,
    pub mod_id: u32,
    pub length: u16,
    pub seq: u32,
}

impl Header {
    /// 解析主头；版本不匹配按帧错误处理
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                need: HEADER_SIZE,
                have: frame.len(),
            });
        }

        let vers = frame[1];
        if vers != PROTO_VERS {
            return Err(FrameError::Version(vers));
        }

        Ok(Self {
            family: MsgFamily::from_u8(frame[0])?,
            vers,
            enb_id: read_u32(frame, 2),
            cell_id: read_u16(frame, 6),
            mod_id: read_u32(frame, 8),
            length: read_u16(frame, 12),
            seq: read_u32(frame, SEQ_OFFSET),
        })
    }
}

/// 读取帧中的序列号
pub fn seq_of(frame: &[u8]) -> Result<u32, FrameError> {
    if frame.len() < HEADER_SIZE {
        return Err(FrameError::Truncated {
            need: HEADER_SIZE,
            have: frame.len(),
        });
    }
    Ok(read_u32(frame, SEQ_OFFSET))
}

/// 就地写入序列号（发送前最后一步）
pub fn stamp_seq(frame: &mut [u8], seq: u32) -> Result<(), FrameError> {
    if frame.len() < HEADER_SIZE {
        return Err(FrameError::Truncated {
            need: HEADER_SIZE,
            have: frame.len(),
        });
    }
    frame[SEQ_OFFSET..SEQ_OFFSET + 4].copy_from_slice(&seq.to_be_bytes());
    Ok(())
}

/// 解析事件子头：(事件种类, 方向, 操作)
pub fn event_info(frame: &[u8]) -> Result<(ActionKind, Direction, OpKind), FrameError> {
    if frame.len() < BODY_OFFSET {
        return Err(FrameError::Truncated {
            need: BODY_OFFSET,
            have: frame.len(),
        });
    }

    Ok((
        ActionKind::from_u8(frame[HEADER_SIZE]),
        Direction::from_u8(frame[HEADER_SIZE + 1]),
        OpKind::from_u8(frame[HEADER_SIZE + 2]),
    ))
}

/// 组装一个完整帧（不含长度前缀）；length 字段自动回填
pub fn build_frame(
    family: MsgFamily,
    enb_id: u32,
    cell_id: u16,
    mod_id: u32,
    action: ActionKind,
    dir: Direction,
    op: OpKind,
    body: &[u8],
) -> Vec<u8> {
    let total = BODY_OFFSET + body.len();
    let mut frame = Vec::with_capacity(total);

    frame.push(family.as_u8());
    frame.push(PROTO_VERS);
    frame.extend_from_slice(&enb_id.to_be_bytes());
    frame.extend_from_slice(&cell_id.to_be_bytes());
    frame.extend_from_slice(&mod_id.to_be_bytes());
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // seq 发送时回填

    frame.push(action.as_u8());
    frame.push(dir.as_u8());
    frame.push(op.as_u8());

    frame.extend_from_slice(body);
    frame
}

/// hello 请求（keepalive）：正文为 `id:u32, period_ms:u32`
pub fn hello_request(enb_id: u32, period_ms: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&enb_id.to_be_bytes());
    body.extend_from_slice(&period_ms.to_be_bytes());

    build_frame(
        MsgFamily::Schedule,
        enb_id,
        0,
        0,
        ActionKind::Hello,
        Direction::Request,
        OpKind::Unspecified,
        &body,
    )
}

/// 基站能力查询请求（控制器 → Agent；测试的 mock 控制器也用它）
pub fn enb_setup_request(enb_id: u32, mod_id: u32) -> Vec<u8> {
    build_frame(
        MsgFamily::Single,
        enb_id,
        0,
        mod_id,
        ActionKind::EnbSetup,
        Direction::Request,
        OpKind::Unspecified,
        &[],
    )
}

/// 小区能力查询请求
pub fn cell_setup_request(enb_id: u32, cell_id: u16, mod_id: u32) -> Vec<u8> {
    build_frame(
        MsgFamily::Single,
        enb_id,
        cell_id,
        mod_id,
        ActionKind::CellSetup,
        Direction::Request,
        OpKind::Unspecified,
        &[],
    )
}

/// 切换请求正文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoverReq {
    pub rnti: u16,
    pub target_enb: u32,
    pub target_cell: u16,
    pub cause: u8,
}

/// 切换请求：源小区放在主头 cell_id 里，正文为目标信息
pub fn handover_request(enb_id: u32, source_cell: u16, mod_id: u32, ho: HandoverReq) -> Vec<u8> {
    let mut body = Vec::with_capacity(9);
    body.extend_from_slice(&ho.rnti.to_be_bytes());
    body.extend_from_slice(&ho.target_enb.to_be_bytes());
    body.extend_from_slice(&ho.target_cell.to_be_bytes());
    body.push(ho.cause);

    build_frame(
        MsgFamily::Single,
        enb_id,
        source_cell,
        mod_id,
        ActionKind::Handover,
        Direction::Request,
        OpKind::Unspecified,
        &body,
    )
}

pub fn parse_handover(frame: &[u8]) -> Result<HandoverReq, FrameError> {
    check_body(frame, 9)?;
    Ok(HandoverReq {
        rnti: read_u16(frame, BODY_OFFSET),
        target_enb: read_u32(frame, BODY_OFFSET + 2),
        target_cell: read_u16(frame, BODY_OFFSET + 6),
        cause: frame[BODY_OFFSET + 8],
    })
}

/// UE 测量请求正文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UeMeasureReq {
    pub measure_id: u8,
    pub rnti: u16,
    pub earfcn: u16,
    pub interval: u16,
    pub max_cells: u16,
    pub max_meas: u16,
}

pub fn ue_measure_request(enb_id: u32, mod_id: u32, op: OpKind, req: UeMeasureReq) -> Vec<u8> {
    let mut body = Vec::with_capacity(11);
    body.push(req.measure_id);
    body.extend_from_slice(&req.rnti.to_be_bytes());
    body.extend_from_slice(&req.earfcn.to_be_bytes());
    body.extend_from_slice(&req.interval.to_be_bytes());
    body.extend_from_slice(&req.max_cells.to_be_bytes());
    body.extend_from_slice(&req.max_meas.to_be_bytes());

    build_frame(
        MsgFamily::Trigger,
        enb_id,
        0,
        mod_id,
        ActionKind::UeMeasure,
        Direction::Request,
        op,
        &body,
    )
}

pub fn parse_ue_measure(frame: &[u8]) -> Result<UeMeasureReq, FrameError> {
    check_body(frame, 11)?;
    Ok(UeMeasureReq {
        measure_id: frame[BODY_OFFSET],
        rnti: read_u16(frame, BODY_OFFSET + 1),
        earfcn: read_u16(frame, BODY_OFFSET + 3),
        interval: read_u16(frame, BODY_OFFSET + 5),
        max_cells: read_u16(frame, BODY_OFFSET + 7),
        max_meas: read_u16(frame, BODY_OFFSET + 9),
    })
}

/// UE 活动上报订阅（正文为空，订阅关系本身就是全部信息）
pub fn ue_report_request(enb_id: u32, mod_id: u32, op: OpKind) -> Vec<u8> {
    build_frame(
        MsgFamily::Trigger,
        enb_id,
        0,
        mod_id,
        ActionKind::UeReport,
        Direction::Request,
        op,
        &[],
    )
}

/// MAC 层状态上报订阅：正文为 `interval_ms:u16`
pub fn mac_report_request(enb_id: u32, cell_id: u16, mod_id: u32, op: OpKind, interval: u16) -> Vec<u8> {
    build_frame(
        MsgFamily::Trigger,
        enb_id,
        cell_id,
        mod_id,
        ActionKind::MacReport,
        Direction::Request,
        op,
        &interval.to_be_bytes(),
    )
}

pub fn parse_mac_report(frame: &[u8]) -> Result<u16, FrameError> {
    check_body(frame, 2)?;
    Ok(read_u16(frame, BODY_OFFSET))
}

fn check_body(frame: &[u8], body_len: usize) -> Result<(), FrameError> {
    if frame.len() < BODY_OFFSET + body_len {
        return Err(FrameError::Truncated {
            need: BODY_OFFSET + body_len,
            have: frame.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
