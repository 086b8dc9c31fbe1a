use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use taskgrid_core::{Algorithm, GridError, GridResult, LoadBalancingConfig};
use tracing::info;

use super::{AdaptiveBundler, Bundler, FixedSizeBundler, NodeThreadsBundler};

/// 自定义策略的构造函数：`(配置, 版本号) -> 原型`
pub type BundlerProvider = Arc<dyn Fn(&LoadBalancingConfig, u64) -> Box<dyn Bundler> + Send + Sync>;

struct FactoryState {
    config: LoadBalancingConfig,
    prototype: Box<dyn Bundler>,
}

/// 分包策略工厂
///
/// 持有当前配置对应的原型，节点连接通过 [`BundlerFactory::new_bundler`] 获取副本。
/// 管理请求修改配置后版本号递增，节点上下文在下一次分发前发现自己的策略
/// 版本较旧，就会换成新副本。
pub struct BundlerFactory {
    state: Mutex<FactoryState>,
    providers: RwLock<HashMap<String, BundlerProvider>>,
    timestamp: AtomicU64,
}

impl BundlerFactory {
    pub fn new(config: LoadBalancingConfig) -> GridResult<Self> {
        Self::with_providers(config, HashMap::new())
    }

    pub fn with_providers(
        config: LoadBalancingConfig,
        providers: HashMap<String, BundlerProvider>,
    ) -> GridResult<Self> {
        let prototype = build(&config, 1, &providers)?;
        info!(
            "负载均衡算法: {} (初始大小: {}, 最大: {})",
            config.algorithm, config.size, config.max_bundle_size
        );
        Ok(Self {
            state: Mutex::new(FactoryState { config, prototype }),
            providers: RwLock::new(providers),
            timestamp: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册自定义策略，之后可以通过 `Algorithm::Custom(name)` 使用
    pub fn register_provider(&self, name: impl Into<String>, provider: BundlerProvider) {
        let name = name.into();
        info!("注册自定义负载均衡算法: {}", name);
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, provider);
    }

    pub fn new_bundler(&self) -> Box<dyn Bundler> {
        self.lock().prototype.copy()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn config(&self) -> LoadBalancingConfig {
        self.lock().config.clone()
    }

    /// 配置中的分包大小
    pub fn bundle_size(&self) -> usize {
        self.lock().config.size
    }

    /// 替换配置并递增版本号
    pub fn update(&self, config: LoadBalancingConfig) -> GridResult<()> {
        config
            .validate()
            .map_err(|e| GridError::config_error(e.to_string()))?;

        let mut state = self.lock();
        let timestamp = self.timestamp() + 1;
        let prototype = {
            let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
            build(&config, timestamp, &providers)?
        };
        state.prototype.dispose();
        state.prototype = prototype;
        info!(
            "负载均衡配置已更新: {} (大小: {}, 版本: {})",
            config.algorithm, config.size, timestamp
        );
        state.config = config;
        self.timestamp.store(timestamp, Ordering::Release);
        Ok(())
    }

    /// 以 JSON 参数覆盖当前配置中的同名字段后更新
    ///
    /// 例如 `{"algorithm": "fixed", "size": 8}`。
    pub fn update_from_parameters(
        &self,
        parameters: &HashMap<String, serde_json::Value>,
    ) -> GridResult<LoadBalancingConfig> {
        let mut value = serde_json::to_value(self.config())?;
        if let Some(fields) = value.as_object_mut() {
            for (key, v) in parameters {
                if !fields.contains_key(key) {
                    return Err(GridError::config_error(format!("未知的负载均衡参数: {key}")));
                }
                fields.insert(key.clone(), v.clone());
            }
        }
        let config: LoadBalancingConfig = serde_json::from_value(value)
            .map_err(|e| GridError::config_error(format!("无效的负载均衡参数: {e}")))?;
        self.update(config.clone())?;
        Ok(config)
    }
}

fn build(
    config: &LoadBalancingConfig,
    timestamp: u64,
    providers: &HashMap<String, BundlerProvider>,
) -> GridResult<Box<dyn Bundler>> {
    Ok(match &config.algorithm {
        Algorithm::Fixed => Box::new(FixedSizeBundler::new(config.size, timestamp)),
        Algorithm::AutoTuned => Box::new(AdaptiveBundler::autotuned(config, timestamp)),
        Algorithm::Proportional => Box::new(AdaptiveBundler::proportional(config, timestamp)),
        Algorithm::NodeThreads => Box::new(NodeThreadsBundler::new(config, timestamp)),
        Algorithm::Custom(name) => {
            let provider = providers.get(name).ok_or_else(|| {
                GridError::LoadBalancing(format!("未注册的负载均衡算法: {name}"))
            })?;
            provider(config, timestamp)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed(size: usize) -> LoadBalancingConfig {
        LoadBalancingConfig {
            algorithm: Algorithm::Fixed,
            size,
            ..LoadBalancingConfig::default()
        }
    }

    #[test]
    fn test_builds_configured_algorithm() {
        let factory = BundlerFactory::new(fixed(4)).unwrap();
        let bundler = factory.new_bundler();
        assert_eq!(bundler.name(), "fixed");
        assert_eq!(bundler.bundle_size(), 4);
        assert_eq!(bundler.timestamp(), factory.timestamp());
    }

    #[test]
    fn test_update_bumps_timestamp() {
        let factory = BundlerFactory::new(fixed(4)).unwrap();
        let old = factory.new_bundler();

        let config = factory
            .update_from_parameters(&HashMap::from([("size".to_string(), json!(9))]))
            .unwrap();
        assert_eq!(config.size, 9);
        assert!(old.timestamp() < factory.timestamp());
        assert_eq!(factory.new_bundler().bundle_size(), 9);
        assert_eq!(factory.bundle_size(), 9);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let factory = BundlerFactory::new(fixed(4)).unwrap();
        let ts = factory.timestamp();
        assert!(factory
            .update_from_parameters(&HashMap::from([("bogus".to_string(), json!(1))]))
            .is_err());
        assert!(factory
            .update_from_parameters(&HashMap::from([("size".to_string(), json!(0))]))
            .is_err());
        assert_eq!(factory.timestamp(), ts);
    }

    #[test]
    fn test_custom_provider() {
        let config = LoadBalancingConfig {
            algorithm: Algorithm::Custom("seven".to_string()),
            ..LoadBalancingConfig::default()
        };
        assert!(BundlerFactory::new(config.clone()).is_err());

        let provider: BundlerProvider =
            Arc::new(|_, ts| Box::new(FixedSizeBundler::new(7, ts)) as Box<dyn Bundler>);
        let factory =
            BundlerFactory::with_providers(config, HashMap::from([("seven".to_string(), provider)]))
                .unwrap();
        assert_eq!(factory.new_bundler().bundle_size(), 7);

        let later: BundlerProvider =
            Arc::new(|_, ts| Box::new(FixedSizeBundler::new(3, ts)) as Box<dyn Bundler>);
        factory.register_provider("three", later);
        factory
            .update_from_parameters(&HashMap::from([(
                "algorithm".to_string(),
                json!({"custom": "three"}),
            )]))
            .unwrap();
        assert_eq!(factory.new_bundler().bundle_size(), 3);
    }
}
