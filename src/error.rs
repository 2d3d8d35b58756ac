//! 定义库的统一错误类型。

use thiserror::Error;

/// 后端的主错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// 打开或协商 Framebuffer 设备失败。
    #[error("Linux Framebuffer 错误: {0}")]
    LinuxFb(#[from] crate::linuxfb::Error),

    /// 目标事件循环没有在运行，或者在完成调用之前退出了。
    #[error("事件循环未运行或已终止")]
    EventLoopTerminated,

    /// 同一个驱动的事件循环已经在另一个线程上运行。
    #[error("事件循环已在运行")]
    AlreadyRunning,

    #[error("绘制线程错误: {0}")]
    DrawThread(String),
}
