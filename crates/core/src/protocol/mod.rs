//! 线上协议
//!
//! 每条连接建立后先发送一个 4 字节大端的通道标识，此后所有数据都是
//! `u32` 大端长度前缀的帧。帧内容在发送前经过 [`DataTransform::wrap`]，
//! 接收后经过 [`DataTransform::unwrap`]。消息头使用 JSON 编码。
//!
//! ```text
//! 客户端 → Driver   JobHeader | 数据提供者 | 任务 × N
//! Driver → 客户端   ResultHeader | 结果 × N（按 position 排序）
//! Driver → 节点     NodeCommand::Bundle | 数据提供者 | 任务 × N
//! 节点 → Driver     NodeInfo（握手）; NodeResultHeader | 结果 × N
//! ```

pub mod frame;
pub mod messages;
pub mod transform;

pub use frame::*;
pub use messages::*;
pub use transform::*;
