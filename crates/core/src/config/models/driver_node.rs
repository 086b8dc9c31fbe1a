use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Driver（调度端）配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// 节点与客户端共用的监听地址，连接用途由首个通道标识区分
    pub bind_address: String,
    /// 管理请求口令
    pub admin_password: String,
    /// 新连接发送通道标识与握手信息的超时（毫秒）
    pub handshake_timeout_ms: u64,
    /// 过期作业扫描间隔（毫秒）
    pub expiration_check_interval_ms: u64,
    /// 帧的最大长度（字节），超过即视为协议错误
    pub max_frame_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:11111".to_string(),
            admin_password: "admin".to_string(),
            handshake_timeout_ms: 10_000,
            expiration_check_interval_ms: 1000,
            max_frame_size: 256 * 1024 * 1024,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("监听地址不能为空"));
        }

        if !self.bind_address.contains(':') {
            return Err(anyhow::anyhow!("监听地址格式无效: {}", self.bind_address));
        }

        if self.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("握手超时必须大于0"));
        }

        if self.expiration_check_interval_ms == 0 {
            return Err(anyhow::anyhow!("过期扫描间隔必须大于0"));
        }

        if self.max_frame_size < 1024 {
            return Err(anyhow::anyhow!("帧最大长度不能小于1024字节"));
        }

        Ok(())
    }
}

/// Node（计算节点）配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 节点唯一标识，为空时启动时生成
    pub uuid: Option<String>,
    /// Driver 地址
    pub driver_address: String,
    /// 执行池线程数
    pub processing_threads: usize,
    /// 管理端口，仅用于节点标识与排序
    pub management_port: u16,
    /// 首次重连等待（毫秒）
    pub reconnect_initial_delay_ms: u64,
    /// 重连等待上限（毫秒）
    pub reconnect_max_delay_ms: u64,
    /// 最大重连次数，0 表示无限重试
    pub max_reconnect_attempts: u32,
    /// 附加的节点属性，供执行策略匹配
    pub properties: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            driver_address: "127.0.0.1:11111".to_string(),
            processing_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            management_port: 11198,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 10_000,
            max_reconnect_attempts: 0,
            properties: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.driver_address.is_empty() {
            return Err(anyhow::anyhow!("Driver地址不能为空"));
        }

        if self.processing_threads == 0 {
            return Err(anyhow::anyhow!("执行线程数必须大于0"));
        }

        if self.reconnect_initial_delay_ms == 0 {
            return Err(anyhow::anyhow!("重连等待时间必须大于0"));
        }

        if self.reconnect_max_delay_ms < self.reconnect_initial_delay_ms {
            return Err(anyhow::anyhow!(
                "重连等待上限({})不能小于首次等待({})",
                self.reconnect_max_delay_ms,
                self.reconnect_initial_delay_ms
            ));
        }

        if let Some(uuid) = &self.uuid {
            if uuid.is_empty() {
                return Err(anyhow::anyhow!("节点UUID不能为空字符串"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_validation() {
        let mut config = DriverConfig::default();
        assert!(config.validate().is_ok());

        config.bind_address = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_validation() {
        let mut config = NodeConfig::default();
        assert!(config.validate().is_ok());

        config.processing_threads = 0;
        assert!(config.validate().is_err());

        config.processing_threads = 2;
        config.reconnect_max_delay_ms = 10;
        assert!(config.validate().is_err());
    }
}
