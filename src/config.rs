//! Agent 配置
//!
//! 控制器地址 + 各循环的时间参数，进程启动时读取一次。

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// 默认配置文件位置（一行 `"<addr> <port>"`）
pub const DEFAULT_CONFIG_FILE: &str = "/etc/enb-agent/agent.conf";

/// Agent 配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 控制器地址
    pub ctrl_addr: String,
    /// 控制器端口
    pub ctrl_port: u16,
    /// 网络轮询间隔（读无数据时的休眠）
    pub poll_interval: Duration,
    /// 重连尝试间隔
    pub reconnect_interval: Duration,
    /// 单次 TCP connect 超时（保证停止延迟可预期）
    pub connect_timeout: Duration,
    /// 调度器两轮之间的休眠
    pub sched_interval: Duration,
    /// keepalive（hello）周期
    pub hello_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ctrl_addr: "127.0.0.1".to_string(),
            ctrl_port: 2210,
            poll_interval: Duration::from_millis(300),
            reconnect_interval: Duration::from_millis(1300),
            connect_timeout: Duration::from_secs(3),
            sched_interval: Duration::from_millis(1000),
            hello_interval: Duration::from_millis(2000),
        }
    }
}

impl AgentConfig {
    /// 从环境变量创建配置（缺省值兜底）
    ///
    /// - `ENB_AGENT_CTRL_ADDR`: 控制器地址
    /// - `ENB_AGENT_CTRL_PORT`: 控制器端口
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("ENB_AGENT_CTRL_ADDR") {
            config.ctrl_addr = addr;
        }

        if let Ok(port) = std::env::var("ENB_AGENT_CTRL_PORT") {
            if let Ok(port) = port.parse() {
                config.ctrl_port = port;
            }
        }

        config
    }

    /// 从配置文件创建配置（格式：一行 `"<addr> <port>"`）
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;

        let mut parts = raw.split_whitespace();

        let addr = match parts.next() {
            Some(a) => a.to_string(),
            None => bail!("配置文件缺少控制器地址"),
        };

        let port: u16 = match parts.next() {
            Some(p) => p.parse().context("配置文件端口格式错误")?,
            None => bail!("配置文件缺少控制器端口"),
        };

        Ok(Self {
            ctrl_addr: addr,
            ctrl_port: port,
            ..Default::default()
        })
    }

    /// 控制器 `addr:port` 形式
    pub fn controller(&self) -> String {
        format!("{}:{}", self.ctrl_addr, self.ctrl_port)
    }
}
