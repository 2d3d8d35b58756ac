//! 窗口: 所有窗口共享同一块物理 Framebuffer。
//!
//! 可见性与焦点标志只受每个窗口自己的视图锁保护，不受驱动的窗口列表锁保护。

use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::canvas::Canvas;
use crate::error::Error;
use crate::platform::{Driver, DriverContext};
use crate::toolkit::{CanvasObject, Resource, Size};

/// 纯内存剪贴板
#[derive(Debug, Default)]
pub struct Clipboard {
    content: Mutex<String>,
}

impl Clipboard {
    pub fn content(&self) -> String {
        self.content.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_content(&self, content: impl Into<String>) {
        *self.content.lock().unwrap_or_else(|e| e.into_inner()) = content.into();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MenuItem {
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Menu {
    pub label: String,
    pub items: Vec<MenuItem>,
}

/// 主菜单只被保存，Framebuffer 上没有地方绘制原生菜单
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainMenu {
    pub items: Vec<Menu>,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct WindowProps {
    title: String,
    full_screen: bool,
    fixed_size: bool,
    menu: Option<MainMenu>,
    icon: Option<Resource>,
    master: bool,
    on_closed: Option<Callback>,
    on_close_intercept: Option<Callback>,
}

#[derive(Default)]
struct ViewState {
    visible: bool,
    focused: bool,
}

pub struct Window {
    props: Mutex<WindowProps>,
    view: RwLock<ViewState>,
    canvas: Arc<Canvas>,
    clipboard: Clipboard,
    driver: Weak<DriverContext>,
}

impl Window {
    pub(crate) fn new(title: &str, canvas: Canvas, driver: Weak<DriverContext>) -> Self {
        Self {
            props: Mutex::new(WindowProps { title: title.to_owned(), ..Default::default() }),
            view: RwLock::new(ViewState::default()),
            canvas: Arc::new(canvas),
            clipboard: Clipboard::default(),
            driver,
        }
    }

    fn props(&self) -> std::sync::MutexGuard<'_, WindowProps> {
        self.props.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn view_mut(&self) -> std::sync::RwLockWriteGuard<'_, ViewState> {
        self.view.write().unwrap_or_else(|e| e.into_inner())
    }

    fn view(&self) -> std::sync::RwLockReadGuard<'_, ViewState> {
        self.view.read().unwrap_or_else(|e| e.into_inner())
    }

    /// 在同一把视图锁下读取可见性和画布，供绘制循环使用
    pub(crate) fn snapshot(&self) -> (bool, Arc<Canvas>) {
        let view = self.view();
        (view.visible, self.canvas.clone())
    }

    pub fn canvas(&self) -> &Arc<Canvas> {
        &self.canvas
    }

    pub fn clipboard(&self) -> &Clipboard {
        &self.clipboard
    }

    /// 触发关闭回调，并从驱动的窗口列表中移除
    pub fn close(&self) {
        let on_closed = self.props().on_closed.clone();
        if let Some(callback) = on_closed {
            callback();
        }
        self.view_mut().focused = false;
        if let Some(driver) = self.driver.upgrade() {
            driver.remove_window(self);
        }
    }

    pub fn content(&self) -> Option<Arc<dyn CanvasObject>> {
        self.canvas.content()
    }

    pub fn set_content(&self, content: Arc<dyn CanvasObject>) {
        self.canvas.set_content(Some(content));
    }

    pub fn title(&self) -> String {
        self.props().title.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.props().title = title.into();
    }

    pub fn full_screen(&self) -> bool {
        self.props().full_screen
    }

    pub fn set_full_screen(&self, full_screen: bool) {
        self.props().full_screen = full_screen;
    }

    pub fn fixed_size(&self) -> bool {
        self.props().fixed_size
    }

    pub fn set_fixed_size(&self, fixed: bool) {
        self.props().fixed_size = fixed;
    }

    pub fn padded(&self) -> bool {
        self.canvas.padded()
    }

    pub fn set_padded(&self, padded: bool) {
        self.canvas.set_padded(padded);
    }

    pub fn main_menu(&self) -> Option<MainMenu> {
        self.props().menu.clone()
    }

    pub fn set_main_menu(&self, menu: Option<MainMenu>) {
        self.props().menu = menu;
    }

    pub fn icon(&self) -> Option<Resource> {
        self.props().icon.clone()
    }

    /// 图标只被保存，不会绘制到屏幕上
    pub fn set_icon(&self, icon: Option<Resource>) {
        self.props().icon = icon;
    }

    pub fn is_master(&self) -> bool {
        self.props().master
    }

    pub fn set_master(&self) {
        self.props().master = true;
    }

    pub fn set_on_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.props().on_closed = Some(Arc::new(callback));
    }

    /// 保存关闭拦截回调。`close()` 是程序化关闭路径，不会经过它。
    pub fn set_close_intercept(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.props().on_close_intercept = Some(Arc::new(callback));
    }

    pub fn close_intercept(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        self.props().on_close_intercept.clone()
    }

    pub fn resize(&self, size: Size) {
        self.canvas.resize(size);
    }

    /// 单一物理屏幕上没有"居中"可言
    pub fn center_on_screen(&self) {}

    pub fn is_visible(&self) -> bool {
        self.view().visible
    }

    pub fn is_focused(&self) -> bool {
        self.view().focused
    }

    /// 聚焦本窗口，同一驱动下的其他窗口全部失焦
    pub fn request_focus(&self) {
        if let Some(driver) = self.driver.upgrade() {
            for win in driver.window_list() {
                win.view_mut().focused = false;
            }
        }
        self.view_mut().focused = true;
    }

    pub fn show(&self) {
        self.request_focus();
        self.view_mut().visible = true;
        if let Some(content) = self.canvas.content() {
            content.show();
        }
    }

    pub fn hide(&self) {
        {
            let mut view = self.view_mut();
            view.focused = false;
            view.visible = false;
        }
        if let Some(content) = self.canvas.content() {
            content.hide();
        }
    }

    /// 标记画布需要重绘
    pub fn refresh(&self) {
        self.canvas.set_dirty(true);
    }

    /// 显示窗口，然后阻塞在驱动的事件循环上
    pub fn show_and_run(&self) -> Result<(), Error> {
        self.show();
        let driver = self
            .driver
            .upgrade()
            .map(Driver::from_context)
            .ok_or(Error::EventLoopTerminated)?;
        driver.run()
    }
}
