//! 工具包侧的接口契约。
//!
//! 布局、绘制与字体测量都由外部工具包提供，本后端只通过这里的 trait 使用它们。

use std::sync::{Arc, Mutex};

use crate::canvas::Canvas;
use crate::pixels::{Color, Image};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const ZERO: Size = Size { width: 0.0, height: 0.0 };

    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn add(self, other: Size) -> Size {
        Size::new(self.width + other.width, self.height + other.height)
    }

    pub fn subtract(self, other: Size) -> Size {
        Size::new(self.width - other.width, self.height - other.height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const ZERO: Position = Position { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn add(self, other: Position) -> Position {
        Position::new(self.x + other.x, self.y + other.y)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextStyle {
    pub bold: bool,
    pub italic: bool,
    pub monospace: bool,
}

/// 场景图中的一个对象
///
/// 所有方法都取 `&self`，实现方自行负责内部可变性；对象会在主循环与绘制线程之间共享。
pub trait CanvasObject: Send + Sync {
    fn min_size(&self) -> Size;
    fn size(&self) -> Size;
    fn resize(&self, size: Size);
    fn position(&self) -> Position;
    fn move_to(&self, pos: Position);
    fn visible(&self) -> bool;
    fn show(&self);
    fn hide(&self);

    /// 布局后的子对象。叶子对象返回空列表。
    fn children(&self) -> Vec<Arc<dyn CanvasObject>> {
        Vec::new()
    }

    fn focusable(&self) -> bool {
        false
    }

    fn focus_gained(&self) {}

    fn focus_lost(&self) {}
}

/// 按键事件，只携带键名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub name: String,
}

pub type KeyHandler = Arc<dyn Fn(&KeyEvent) + Send + Sync>;
pub type RuneHandler = Arc<dyn Fn(char) + Send + Sync>;

/// 命名的静态资源，例如窗口图标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Vertical,
    VerticalUpsideDown,
    Left,
    Right,
}

/// 设备能力。Framebuffer 屏幕方向固定，也没有输入设备。
#[derive(Debug, Clone, Copy, Default)]
pub struct Device;

impl Device {
    pub fn orientation(&self) -> Orientation {
        Orientation::Vertical
    }

    pub fn is_mobile(&self) -> bool {
        false
    }

    pub fn has_keyboard(&self) -> bool {
        false
    }
}

/// 按对象身份比较 (忽略 vtable)
pub fn same_object(a: &Arc<dyn CanvasObject>, b: &Arc<dyn CanvasObject>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// 把整个画布光栅化为内存图像的软件绘制器
pub trait SoftwarePainter: Send + Sync {
    fn paint(&self, canvas: &Canvas) -> Image;

    /// 主题或设置变化后丢弃缓存的字形等渲染状态
    fn clear_cache(&self) {}
}

/// 文本测量
pub trait FontMeasurer: Send + Sync {
    fn measure_text(&self, text: &str, size: f32, style: TextStyle) -> Size;

    fn clear_cache(&self) {}
}

pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// 主题/设置提供者
pub trait Settings: Send + Sync {
    fn padding(&self) -> f32;
    fn background_color(&self) -> Color;
    /// 注册设置变化回调，回调可能在任意线程上被调用
    fn add_change_listener(&self, listener: ChangeListener);
}

/// 内置的默认主题
pub struct ThemeSettings {
    state: Mutex<ThemeState>,
    listeners: Mutex<Vec<ChangeListener>>,
}

#[derive(Clone, Copy)]
struct ThemeState {
    padding: f32,
    background: Color,
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self::new(4.0, Color::rgb(0x42, 0x42, 0x42))
    }
}

impl ThemeSettings {
    pub fn new(padding: f32, background: Color) -> Self {
        Self {
            state: Mutex::new(ThemeState { padding, background }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> ThemeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 修改主题并通知所有监听者
    pub fn set_theme(&self, padding: f32, background: Color) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ThemeState { padding, background };
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener();
        }
    }
}

impl Settings for ThemeSettings {
    fn padding(&self) -> f32 {
        self.state().padding
    }

    fn background_color(&self) -> Color {
        self.state().background
    }

    fn add_change_listener(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

/// 未注入 `FontMeasurer` 时使用的等宽估算: 每字符 0.6 倍字号，行高 1.2 倍字号。
pub(crate) fn estimate_text_size(text: &str, size: f32) -> Size {
    let chars = text.chars().count() as f32;
    Size::new((chars * size * 6.0 / 10.0).ceil(), (size * 12.0 / 10.0).ceil())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn theme_change_notifies_listeners() {
        let settings = ThemeSettings::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        settings.add_change_listener(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        settings.set_theme(8.0, Color::WHITE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(settings.padding(), 8.0);
        assert_eq!(settings.background_color(), Color::WHITE);
    }

    #[test]
    fn framebuffer_device_is_fixed_desktop() {
        let device = Device;
        assert_eq!(device.orientation(), Orientation::Vertical);
        assert!(!device.is_mobile());
        assert!(!device.has_keyboard());
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_text_size("abc", 10.0), Size::new(18.0, 12.0));
        assert_eq!(estimate_text_size("", 11.0), Size::new(0.0, 14.0));
    }
}
