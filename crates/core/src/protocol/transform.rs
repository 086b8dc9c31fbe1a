use crate::GridResult;

/// 数据变换钩子（加密、压缩等）
///
/// 作用于每一帧的字节，对协议其余部分透明。
#[cfg_attr(test, mockall::automock)]
pub trait DataTransform: Send + Sync {
    /// 发送前变换
    fn wrap(&self, data: Vec<u8>) -> GridResult<Vec<u8>>;

    /// 接收后还原
    fn unwrap(&self, data: Vec<u8>) -> GridResult<Vec<u8>>;
}

/// 不做任何变换
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl DataTransform for IdentityTransform {
    fn wrap(&self, data: Vec<u8>) -> GridResult<Vec<u8>> {
        Ok(data)
    }

    fn unwrap(&self, data: Vec<u8>) -> GridResult<Vec<u8>> {
        Ok(data)
    }
}
