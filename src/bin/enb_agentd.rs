//! enb-agentd - 基站控制面 Agent 守护进程
//!
//! 负责：
//! - 维持与控制器的 TCP 连接
//! - 把控制器请求转给底层协议栈
//! - keepalive 与断链重连

use std::sync::Arc;

use anyhow::Result;
use enb_agent::proto::{HandoverReq, UeMeasureReq};
use enb_agent::{AgentConfig, AgentOps, AgentRegistry, DEFAULT_CONFIG_FILE};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 独立运行时没有真实协议栈，把控制器的请求记到日志里
struct LoggingOps;

impl AgentOps for LoggingOps {
    fn enb_setup_request(&self, module: u32) -> Result<()> {
        tracing::info!("📡 基站能力查询: module={}", module);
        Ok(())
    }

    fn cell_setup_request(&self, module: u32, cell_id: u16) -> Result<()> {
        tracing::info!("📡 小区能力查询: module={} cell={}", module, cell_id);
        Ok(())
    }

    fn ue_report(&self, module: u32, trigger_id: u32) -> Result<()> {
        tracing::info!("📡 UE 上报订阅: module={} trigger={}", module, trigger_id);
        Ok(())
    }

    fn ue_measure(&self, module: u32, trigger_id: u32, req: UeMeasureReq) -> Result<()> {
        tracing::info!(
            "📡 UE 测量订阅: module={} trigger={} rnti={} earfcn={}",
            module,
            trigger_id,
            req.rnti,
            req.earfcn
        );
        Ok(())
    }

    fn mac_report(&self, module: u32, trigger_id: u32, interval: u16) -> Result<()> {
        tracing::info!(
            "📡 MAC 上报订阅: module={} trigger={} interval={}ms",
            module,
            trigger_id,
            interval
        );
        Ok(())
    }

    fn handover_ue(&self, module: u32, source_cell: u16, ho: HandoverReq) -> Result<()> {
        tracing::info!(
            "📡 切换请求: module={} rnti={} {}→enb{}/{}",
            module,
            ho.rnti,
            source_cell,
            ho.target_enb,
            ho.target_cell
        );
        Ok(())
    }

    fn disconnected(&self) -> Result<()> {
        tracing::info!("📡 控制器连接断开");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("enb_agent=debug".parse()?))
        .init();

    tracing::info!("🚀 enb-agentd v{}", env!("CARGO_PKG_VERSION"));

    // 配置文件存在就用文件，否则退回环境变量
    let config = match AgentConfig::from_file(DEFAULT_CONFIG_FILE) {
        Ok(config) => config,
        Err(_) => AgentConfig::from_env(),
    };
    tracing::info!("控制器地址: {}", config.controller());

    let enb_id: u32 = std::env::var("ENB_AGENT_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let registry = AgentRegistry::new(config);
    registry.start(enb_id, Arc::new(LoggingOps))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到中断信号，准备退出...");

    registry.stop().await;
    tracing::info!("👋 enb-agentd exiting");
    Ok(())
}
