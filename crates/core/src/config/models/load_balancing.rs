use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// 负载均衡算法
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// 固定大小
    Fixed,
    /// 自动调优（线性权重，全局共享样本窗口）
    AutoTuned,
    /// 按比例分配
    #[default]
    Proportional,
    /// 按节点线程数
    NodeThreads,
    /// 通过 `BundlerFactory::register_provider` 注册的自定义算法
    Custom(String),
}

impl Algorithm {
    pub fn name(&self) -> &str {
        match self {
            Algorithm::Fixed => "fixed",
            Algorithm::AutoTuned => "autotuned",
            Algorithm::Proportional => "proportional",
            Algorithm::NodeThreads => "nodethreads",
            Algorithm::Custom(name) => name,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "manual" => Ok(Algorithm::Fixed),
            "autotuned" | "auto_tuned" | "simple" => Ok(Algorithm::AutoTuned),
            "proportional" => Ok(Algorithm::Proportional),
            "nodethreads" | "node_threads" => Ok(Algorithm::NodeThreads),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(Algorithm::Custom(name.to_string())),
                _ => Err(format!("未知的负载均衡算法: {s}")),
            },
        }
    }
}

/// 比例分配的权重方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    /// `maxMean / nodeMean`
    Linear,
    /// `(maxMean / nodeMean)^2`
    #[default]
    Squared,
}

impl Weighting {
    pub fn apply(&self, ratio: f64) -> f64 {
        match self {
            Weighting::Linear => ratio,
            Weighting::Squared => ratio * ratio,
        }
    }
}

/// 负载均衡配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub algorithm: Algorithm,
    /// 固定大小，同时也是自适应算法的初始大小
    pub size: usize,
    /// 所有节点分配之和
    pub max_bundle_size: usize,
    /// 每个节点的样本窗口长度
    pub performance_cache_size: usize,
    /// 参与重新分配所需的最少样本数
    pub min_samples_to_analyse: usize,
    /// 比例算法的权重方式
    pub weighting: Weighting,
    /// NodeThreads 算法的倍数
    pub threads_multiplier: usize,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Proportional,
            size: 5,
            max_bundle_size: 100,
            performance_cache_size: 300,
            min_samples_to_analyse: 3,
            weighting: Weighting::Squared,
            threads_multiplier: 1,
        }
    }
}

impl LoadBalancingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.size == 0 {
            return Err(anyhow::anyhow!("分包大小必须大于0"));
        }

        if self.max_bundle_size == 0 {
            return Err(anyhow::anyhow!("最大分包大小必须大于0"));
        }

        if self.performance_cache_size == 0 {
            return Err(anyhow::anyhow!("样本窗口长度必须大于0"));
        }

        if self.min_samples_to_analyse == 0 {
            return Err(anyhow::anyhow!("最少分析样本数必须大于0"));
        }

        if self.threads_multiplier == 0 {
            return Err(anyhow::anyhow!("线程倍数必须大于0"));
        }

        if let Algorithm::Custom(name) = &self.algorithm {
            if name.is_empty() {
                return Err(anyhow::anyhow!("自定义算法名称不能为空"));
            }
        }

        Ok(())
    }
}
