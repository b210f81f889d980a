//! 共享库
//!
//! 推理内核宿主程序共用的配置加载与可观测性初始化代码。

pub mod config;
pub mod observability;
