use super::Bundler;

/// 固定大小策略，反馈不产生任何影响
#[derive(Debug, Clone)]
pub struct FixedSizeBundler {
    size: usize,
    timestamp: u64,
}

impl FixedSizeBundler {
    pub fn new(size: usize, timestamp: u64) -> Self {
        Self {
            size: size.max(1),
            timestamp,
        }
    }
}

impl Bundler for FixedSizeBundler {
    fn name(&self) -> &str {
        "fixed"
    }

    fn bundle_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, _completed: usize, _total_time_nanos: f64) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(self.clone())
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}
