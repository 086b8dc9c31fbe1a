//! TaskGrid 可执行程序的应用层：运行模式编排与优雅关闭。

pub mod app;
pub mod shutdown;
