use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    total_time_nanos: f64,
    task_count: usize,
}

/// 单个节点的性能样本窗口
///
/// 保存最近 `window_length` 次反馈，计算每个任务的平均耗时和方差，
/// 并记录策略分配给该节点的大小。
#[derive(Debug, Clone)]
pub struct BundleDataHolder {
    samples: VecDeque<Sample>,
    window_length: usize,
    mean: f64,
    variance: f64,
    size: usize,
}

impl BundleDataHolder {
    pub fn new(window_length: usize, initial_size: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window_length: window_length.max(1),
            mean: 0.0,
            variance: 0.0,
            size: initial_size.max(1),
        }
    }

    pub fn add_sample(&mut self, task_count: usize, total_time_nanos: f64) {
        self.samples.push_back(Sample {
            total_time_nanos,
            task_count,
        });
        while self.samples.len() > self.window_length {
            self.samples.pop_front();
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let tasks: usize = self.samples.iter().map(|s| s.task_count).sum();
        if tasks == 0 {
            self.mean = 0.0;
            self.variance = 0.0;
            return;
        }
        let total: f64 = self.samples.iter().map(|s| s.total_time_nanos).sum();
        let mean = total / tasks as f64;
        // 以任务数加权的每任务耗时方差
        let variance = self
            .samples
            .iter()
            .map(|s| {
                let per_task = s.total_time_nanos / s.task_count as f64;
                (per_task - mean).powi(2) * s.task_count as f64
            })
            .sum::<f64>()
            / tasks as f64;
        self.mean = mean;
        self.variance = variance;
    }

    /// 每个任务的平均耗时（纳秒）
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    /// 调整窗口长度，多出的旧样本被丢弃
    pub fn set_window_length(&mut self, window_length: usize) {
        self.window_length = window_length.max(1);
        while self.samples.len() > self.window_length {
            self.samples.pop_front();
        }
        self.recompute();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size.max(1);
    }
}
