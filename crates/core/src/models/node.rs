use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 节点的管理地址，按主机名再按端口排序
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeManagementInfo {
    pub host: String,
    pub port: u16,
}

impl NodeManagementInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeManagementInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 节点握手信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub uuid: String,
    pub host: String,
    pub management_port: u16,
    /// 执行池线程数
    pub threads: usize,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl NodeInfo {
    pub fn management_info(&self) -> NodeManagementInfo {
        NodeManagementInfo::new(self.host.clone(), self.management_port)
    }

    /// 执行策略可见的属性：自定义属性加上 `node.uuid`、`node.host`、`node.threads`
    pub fn policy_properties(&self) -> HashMap<String, String> {
        let mut props = self.properties.clone();
        props.insert("node.uuid".to_string(), self.uuid.clone());
        props.insert("node.host".to_string(), self.host.clone());
        props.insert("node.threads".to_string(), self.threads.to_string());
        props
    }
}
