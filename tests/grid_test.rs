#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use taskgrid::app::{AppMode, Application};
    use taskgrid::shutdown::ShutdownManager;
    use taskgrid_client::{GridClient, Job};
    use taskgrid_core::{
        models::{TaskBundle, TaskEnvelope, TaskResult, TaskState},
        protocol::{AdminCommand, AdminRequest},
        Algorithm, AppConfig, GridResult, NodeConfig,
    };
    use taskgrid_dispatcher::{Driver, DriverContext, DriverExit};
    use taskgrid_worker::{
        ExecutionManagerListener, ExecutorRegistry, Node, TaskContext, TaskExecutor,
    };
    use tokio::sync::{oneshot, Notify};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(10);

    struct RunningDriver {
        address: String,
        context: Arc<DriverContext>,
        _handle: JoinHandle<GridResult<DriverExit>>,
    }

    async fn start_driver(size: usize) -> RunningDriver {
        let mut config = AppConfig::default();
        config.driver.bind_address = "127.0.0.1:0".to_string();
        config.load_balancing.algorithm = Algorithm::Fixed;
        config.load_balancing.size = size;

        let driver = Driver::new(&config).unwrap();
        let listener = driver.bind().await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let context = driver.context();
        let handle = tokio::spawn(driver.run(listener, std::future::pending()));
        RunningDriver {
            address,
            context,
            _handle: handle,
        }
    }

    fn node_config(address: &str, uuid: &str) -> NodeConfig {
        NodeConfig {
            uuid: Some(uuid.to_string()),
            driver_address: address.to_string(),
            processing_threads: 2,
            ..NodeConfig::default()
        }
    }

    struct RunningNode {
        node: Arc<Node>,
        stop: Option<oneshot::Sender<()>>,
        handle: JoinHandle<GridResult<()>>,
    }

    impl RunningNode {
        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            tokio::time::timeout(WAIT, self.handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    fn start_node(config: NodeConfig, registry: Arc<ExecutorRegistry>) -> RunningNode {
        let node = Arc::new(Node::new(config, registry));
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = {
            let node = node.clone();
            tokio::spawn(async move {
                node.run(async move {
                    let _ = stopped.await;
                })
                .await
            })
        };
        RunningNode {
            node,
            stop: Some(stop),
            handle,
        }
    }

    /// 一直阻塞到被取消的任务
    struct BlockingWork {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl TaskExecutor for BlockingWork {
        fn kind(&self) -> &str {
            "work"
        }

        async fn execute(&self, _context: &TaskContext) -> GridResult<Vec<u8>> {
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    /// 返回带节点标记的任务内容
    struct TaggedWork;

    #[async_trait]
    impl TaskExecutor for TaggedWork {
        fn kind(&self) -> &str {
            "work"
        }

        async fn execute(&self, context: &TaskContext) -> GridResult<Vec<u8>> {
            let mut output = b"done:".to_vec();
            output.extend_from_slice(&context.body);
            Ok(output)
        }
    }

    #[derive(Default)]
    struct BundleSizes(Mutex<Vec<usize>>);

    impl ExecutionManagerListener for BundleSizes {
        fn bundle_executed(&self, bundle: &TaskBundle, _results: &[TaskResult], _throwable: Option<&str>) {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(bundle.task_count());
        }
    }

    fn work_job(uuid: &str, kind: &str, tasks: usize) -> Job {
        let mut job = Job::new("grid test").with_uuid(uuid);
        for i in 0..tasks {
            job.add_task(TaskEnvelope::new(kind, format!("task-{i}").into_bytes()));
        }
        job
    }

    async fn wait_for_nodes(context: &DriverContext, count: usize) {
        tokio::time::timeout(WAIT, async {
            while context.nodes.len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_job_split_into_fixed_bundles() {
        let driver = start_driver(4).await;
        let node = start_node(
            node_config(&driver.address, "node-a"),
            Arc::new(ExecutorRegistry::with_builtin()),
        );
        let sizes = Arc::new(BundleSizes::default());
        node.node.manager().add_listener(sizes.clone());
        wait_for_nodes(&driver.context, 1).await;

        let client = GridClient::connect(&driver.address).await.unwrap();
        let results = tokio::time::timeout(WAIT, client.execute(&work_job("job-10", "echo", 10)))
            .await
            .unwrap()
            .unwrap();

        let positions: Vec<usize> = results.iter().map(|r| r.position).collect();
        assert_eq!(positions, (0..10).collect::<Vec<_>>());
        for result in &results {
            assert!(result.is_success());
            assert_eq!(
                result.output.as_deref(),
                Some(format!("task-{}", result.position).as_bytes())
            );
        }
        assert_eq!(*sizes.0.lock().unwrap(), vec![4, 4, 2]);

        let snapshot = client.statistics().await.unwrap();
        assert_eq!(snapshot.bundle_size, 4);

        client.close().await.unwrap();
        node.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_node_work_moves_to_second_node() {
        let driver = start_driver(5).await;
        let started = Arc::new(Notify::new());

        let blocking = ExecutorRegistry::new();
        blocking.register(Arc::new(BlockingWork {
            started: started.clone(),
        }));
        let first = start_node(node_config(&driver.address, "node-a"), Arc::new(blocking));
        wait_for_nodes(&driver.context, 1).await;

        let client = GridClient::connect(&driver.address).await.unwrap();
        let handle = client.submit(&work_job("job-5", "work", 5)).await.unwrap();
        tokio::time::timeout(WAIT, started.notified()).await.unwrap();
        first.stop().await;

        let tagged = ExecutorRegistry::new();
        tagged.register(Arc::new(TaggedWork));
        let second = start_node(node_config(&driver.address, "node-b"), Arc::new(tagged));

        let results = tokio::time::timeout(WAIT, handle.await_results())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 5);
        for result in &results {
            assert!(result.is_success());
            assert_eq!(
                result.output.as_deref(),
                Some(format!("done:task-{}", result.position).as_bytes())
            );
        }

        second.stop().await;
    }

    #[tokio::test]
    async fn test_client_cancels_running_job() {
        let driver = start_driver(4).await;
        let started = Arc::new(Notify::new());
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(BlockingWork {
            started: started.clone(),
        }));
        let node = start_node(node_config(&driver.address, "node-a"), Arc::new(registry));
        wait_for_nodes(&driver.context, 1).await;

        let client = GridClient::connect(&driver.address).await.unwrap();
        let handle = client.submit(&work_job("job-c", "work", 4)).await.unwrap();
        tokio::time::timeout(WAIT, started.notified()).await.unwrap();

        assert!(client.cancel_job("job-c").await.unwrap());
        let results = tokio::time::timeout(WAIT, handle.await_results())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.state == TaskState::Cancelled));

        assert!(!client.cancel_job("job-c").await.unwrap());
        node.stop().await;
    }

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    async fn connect_with_retry(address: &str) -> GridClient {
        tokio::time::timeout(WAIT, async {
            loop {
                match GridClient::connect(address).await {
                    Ok(client) => return client,
                    Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_application_all_mode_until_admin_shutdown() {
        let address = free_address();
        let mut config = AppConfig::default();
        config.driver.bind_address = address.clone();
        config.node.driver_address = address.clone();
        config.node.processing_threads = 2;

        let app = Arc::new(Application::new(config, AppMode::All));
        let shutdown = ShutdownManager::new();
        let running = {
            let app = app.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { app.run(shutdown).await })
        };

        let client = connect_with_retry(&address).await;
        let results = tokio::time::timeout(WAIT, client.execute(&work_job("job-app", "echo", 6)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.is_success()));

        let response = client
            .admin(&AdminRequest {
                password: "admin".to_string(),
                command: AdminCommand::Shutdown,
                shutdown_delay_ms: 0,
                restart_delay_ms: 0,
                parameters: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(response.success);

        tokio::time::timeout(WAIT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(shutdown.is_shutdown().await);
    }
}
