//! 连接注册表
//!
//! 节点与客户端连接各自由独立的 tokio 任务驱动，其它组件只通过这里登记的
//! 句柄（UUID + 消息通道）与它们交互，不持有连接对象本身。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use taskgrid_core::models::{NodeInfo, NodeManagementInfo, TaskResult};

/// 发给节点连接任务的控制消息
#[derive(Debug, Clone, PartialEq)]
pub enum NodeControl {
    CancelJob { job_uuid: String, requeue: bool },
    Shutdown,
}

/// 已连接节点的句柄
#[derive(Debug)]
pub struct NodeHandle {
    pub info: NodeInfo,
    control: mpsc::UnboundedSender<NodeControl>,
    /// 当前在途包所属的作业
    in_flight_job: Mutex<Option<String>>,
}

impl NodeHandle {
    pub fn new(info: NodeInfo, control: mpsc::UnboundedSender<NodeControl>) -> Self {
        Self {
            info,
            control,
            in_flight_job: Mutex::new(None),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.info.uuid
    }

    pub fn send(&self, control: NodeControl) -> bool {
        self.control.send(control).is_ok()
    }

    pub fn set_in_flight(&self, job_uuid: Option<String>) {
        *self.in_flight_job.lock().unwrap_or_else(|e| e.into_inner()) = job_uuid;
    }

    pub fn in_flight_job(&self) -> Option<String> {
        self.in_flight_job
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<NodeHandle>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记节点，同一 UUID 已存在时返回 `false`
    pub fn register(&self, handle: Arc<NodeHandle>) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(handle.uuid()) {
            return false;
        }
        debug!("节点已登记: {}", handle.uuid());
        nodes.insert(handle.uuid().to_string(), handle);
        true
    }

    pub fn unregister(&self, uuid: &str) -> Option<Arc<NodeHandle>> {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<NodeHandle>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(uuid)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// 当前持有指定作业在途包的节点
    pub fn holding_job(&self, job_uuid: &str) -> Vec<Arc<NodeHandle>> {
        self.all()
            .into_iter()
            .filter(|n| n.in_flight_job().as_deref() == Some(job_uuid))
            .collect()
    }

    /// 按主机名、端口排序的节点列表
    pub fn management_infos(&self) -> Vec<NodeManagementInfo> {
        let mut infos: Vec<_> = self.all().iter().map(|n| n.info.management_info()).collect();
        infos.sort();
        infos
    }

    pub fn broadcast(&self, control: NodeControl) {
        for node in self.all() {
            node.send(control.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 发给客户端连接任务的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// 某个作业的一批结果
    Results {
        /// 队列中的作业（广播副本各不相同）
        job_uuid: String,
        client_job_uuid: String,
        results: Vec<TaskResult>,
    },
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<ClientEvent>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uuid: &str, events: mpsc::UnboundedSender<ClientEvent>) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid.to_string(), events);
    }

    pub fn unregister(&self, uuid: &str) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid);
    }

    pub fn is_connected(&self, uuid: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(uuid)
    }

    /// 投递结果，客户端已断开时返回 `false`
    pub fn deliver(
        &self,
        client_uuid: &str,
        job_uuid: &str,
        client_job_uuid: &str,
        results: Vec<TaskResult>,
    ) -> bool {
        let sender = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_uuid)
            .cloned();
        match sender {
            Some(tx) => tx
                .send(ClientEvent::Results {
                    job_uuid: job_uuid.to_string(),
                    client_job_uuid: client_job_uuid.to_string(),
                    results,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(uuid: &str, host: &str, port: u16) -> (Arc<NodeHandle>, mpsc::UnboundedReceiver<NodeControl>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = NodeInfo {
            uuid: uuid.to_string(),
            host: host.to_string(),
            management_port: port,
            threads: 1,
            properties: HashMap::new(),
        };
        (Arc::new(NodeHandle::new(info, tx)), rx)
    }

    #[test]
    fn test_holding_job_and_ordering() {
        let registry = NodeRegistry::new();
        let (a, _ra) = node("a", "zeta", 1);
        let (b, mut rb) = node("b", "alpha", 2);
        assert!(registry.register(a.clone()));
        assert!(registry.register(b.clone()));
        assert!(!registry.register(b.clone()));

        b.set_in_flight(Some("job-1".to_string()));
        let holders = registry.holding_job("job-1");
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].uuid(), "b");

        assert!(holders[0].send(NodeControl::CancelJob {
            job_uuid: "job-1".to_string(),
            requeue: false
        }));
        assert!(matches!(rb.try_recv(), Ok(NodeControl::CancelJob { .. })));

        let infos = registry.management_infos();
        assert_eq!(infos[0].host, "alpha");
        registry.unregister("a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_client_delivery() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1", tx);

        assert!(registry.deliver("c1", "j1", "j1", vec![TaskResult::cancelled(0)]));
        assert!(!registry.deliver("c2", "j1", "j1", vec![]));
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Results { .. })));

        registry.unregister("c1");
        assert!(!registry.is_connected("c1"));
    }
}
