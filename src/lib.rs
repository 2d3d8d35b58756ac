//! 面向保留模式 GUI 工具包的 Linux Framebuffer (linuxfb) 后端
//!
//! 工具包通过 [`toolkit`] 中的 trait 提供绘制、主题和字体测量，
//! 本 crate 负责窗口管理、主循环/绘制循环调度，以及把画布推送到 `/dev/fbN`。
pub mod canvas;
pub mod error;
pub mod linuxfb;
pub mod pixels;
pub mod platform;
pub mod toolkit;
pub mod window;

pub use canvas::Canvas;
pub use error::Error;
pub use platform::{Driver, DriverBuilder, ThreadAffinity};
pub use window::Window;

/// 使用默认配置创建驱动。
///
/// 默认配置打开 `LINUXFB_DEVICE` 或 `/dev/fb0`，像素格式取自 `LINUXFB_FORMAT` (默认 RGB565)。
/// 设备在 [`Driver::run`] 时才会真正打开。
/// 如需自定义，请使用 [`DriverBuilder`]。
pub fn init() -> Driver {
    DriverBuilder::new().build()
}
