//! 画布: 场景图根对象、浮层栈、焦点管理与脏标记。

use std::sync::{Arc, Mutex, RwLock};

use crate::pixels::{Image, PixelFormat};
use crate::toolkit::{
    same_object, CanvasObject, KeyEvent, KeyHandler, Position, RuneHandler, Settings, Size,
    SoftwarePainter,
};

/// 在一棵对象树内管理键盘焦点
pub struct FocusManager {
    root: Option<Arc<dyn CanvasObject>>,
    focused: Mutex<Option<Arc<dyn CanvasObject>>>,
}

impl FocusManager {
    pub fn new(root: Option<Arc<dyn CanvasObject>>) -> Self {
        Self { root, focused: Mutex::new(None) }
    }

    pub fn focused(&self) -> Option<Arc<dyn CanvasObject>> {
        self.focused.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 传入 `None` 即取消焦点
    pub fn focus(&self, obj: Option<Arc<dyn CanvasObject>>) {
        let mut focused = self.focused.lock().unwrap_or_else(|e| e.into_inner());
        match (&*focused, &obj) {
            (Some(old), Some(new)) if same_object(old, new) => return,
            (None, None) => return,
            _ => {}
        }
        if let Some(old) = focused.take() {
            old.focus_lost();
        }
        if let Some(new) = &obj {
            new.focus_gained();
        }
        *focused = obj;
    }

    pub fn focus_next(&self) {
        self.step(1);
    }

    pub fn focus_previous(&self) {
        self.step(-1);
    }

    fn step(&self, direction: isize) {
        let candidates = self.focusable_objects();
        if candidates.is_empty() {
            return;
        }
        let current = self
            .focused()
            .and_then(|f| candidates.iter().position(|c| same_object(c, &f)));
        let len = candidates.len() as isize;
        let next = match current {
            Some(i) => (i as isize + direction).rem_euclid(len),
            None if direction > 0 => 0,
            None => len - 1,
        };
        self.focus(Some(candidates[next as usize].clone()));
    }

    /// 深度优先顺序中所有可见且可聚焦的对象
    fn focusable_objects(&self) -> Vec<Arc<dyn CanvasObject>> {
        fn walk(obj: &Arc<dyn CanvasObject>, out: &mut Vec<Arc<dyn CanvasObject>>) {
            if !obj.visible() {
                return;
            }
            if obj.focusable() {
                out.push(obj.clone());
            }
            for child in obj.children() {
                walk(&child, out);
            }
        }
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            walk(root, &mut out);
        }
        out
    }
}

/// 弹出层/模态层栈，位于内容之上，每层有自己的焦点管理器
#[derive(Default)]
pub struct OverlayStack {
    layers: Vec<(Arc<dyn CanvasObject>, Arc<FocusManager>)>,
}

impl OverlayStack {
    pub fn add(&mut self, overlay: Arc<dyn CanvasObject>) {
        let manager = Arc::new(FocusManager::new(Some(overlay.clone())));
        self.layers.push((overlay, manager));
    }

    /// 移除 `overlay` 以及其上方的所有层
    pub fn remove(&mut self, overlay: &Arc<dyn CanvasObject>) {
        if let Some(i) = self.layers.iter().position(|(o, _)| same_object(o, overlay)) {
            self.layers.truncate(i);
        }
    }

    pub fn top(&self) -> Option<Arc<dyn CanvasObject>> {
        self.layers.last().map(|(o, _)| o.clone())
    }

    pub fn list(&self) -> Vec<Arc<dyn CanvasObject>> {
        self.layers.iter().map(|(o, _)| o.clone()).collect()
    }

    pub fn top_focus_manager(&self) -> Option<Arc<FocusManager>> {
        self.layers.last().map(|(_, m)| m.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

struct CanvasProps {
    size: Size,
    scale: f32,
    padded: bool,
    content: Option<Arc<dyn CanvasObject>>,
    overlays: OverlayStack,
    focus_mgr: Arc<FocusManager>,
    on_typed_key: Option<KeyHandler>,
    on_typed_rune: Option<RuneHandler>,
}

/// 一个窗口独占的渲染目标
///
/// 属性与脏标记分别加锁，调用方不能假设二者之间是原子的。
pub struct Canvas {
    props: RwLock<CanvasProps>,
    dirty: Mutex<bool>,
    painter: Option<Arc<dyn SoftwarePainter>>,
    settings: Arc<dyn Settings>,
}

impl Canvas {
    pub fn new(painter: Option<Arc<dyn SoftwarePainter>>, settings: Arc<dyn Settings>) -> Self {
        Self {
            props: RwLock::new(CanvasProps {
                size: Size::new(10.0, 10.0),
                scale: 1.0,
                padded: true,
                content: None,
                overlays: OverlayStack::default(),
                focus_mgr: Arc::new(FocusManager::new(None)),
                on_typed_key: None,
                on_typed_rune: None,
            }),
            dirty: Mutex::new(false),
            painter,
            settings,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CanvasProps> {
        self.props.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CanvasProps> {
        self.props.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 渲染整个画布。没有注入绘制器时用主题背景色填充。
    pub fn capture(&self) -> Image {
        if let Some(painter) = &self.painter {
            return painter.paint(self);
        }
        let (size, scale) = {
            let props = self.read();
            (props.size, props.scale)
        };
        let width = scale_int(size.width, scale);
        let height = scale_int(size.height, scale);
        Image::filled(width, height, PixelFormat::ARGB8888, self.settings.background_color())
    }

    pub fn content(&self) -> Option<Arc<dyn CanvasObject>> {
        self.read().content.clone()
    }

    /// 整体替换内容。旧内容只是被丢弃，不做额外清理。
    pub fn set_content(&self, content: Option<Arc<dyn CanvasObject>>) {
        let padded = {
            let mut props = self.write();
            props.content = content.clone();
            props.focus_mgr = Arc::new(FocusManager::new(content.clone()));
            props.padded
        };
        self.set_dirty(true);

        let Some(content) = content else {
            return;
        };
        let padding = if padded {
            let p = self.settings.padding() * 2.0;
            Size::new(p, p)
        } else {
            Size::ZERO
        };
        self.resize(content.min_size().add(padding));
    }

    pub fn overlays(&self) -> Vec<Arc<dyn CanvasObject>> {
        self.read().overlays.list()
    }

    pub fn top_overlay(&self) -> Option<Arc<dyn CanvasObject>> {
        self.read().overlays.top()
    }

    pub fn add_overlay(&self, overlay: Arc<dyn CanvasObject>) {
        let size = {
            let mut props = self.write();
            props.overlays.add(overlay.clone());
            props.size
        };
        overlay.resize(size);
        self.set_dirty(true);
    }

    pub fn remove_overlay(&self, overlay: &Arc<dyn CanvasObject>) {
        self.write().overlays.remove(overlay);
        self.set_dirty(true);
    }

    /// 浮层非空时，顶层浮层的焦点管理器优先
    fn focus_manager(&self) -> Arc<FocusManager> {
        let props = self.read();
        props
            .overlays
            .top_focus_manager()
            .unwrap_or_else(|| props.focus_mgr.clone())
    }

    pub fn focus(&self, obj: Arc<dyn CanvasObject>) {
        self.focus_manager().focus(Some(obj));
    }

    pub fn focus_next(&self) {
        self.focus_manager().focus_next();
    }

    pub fn focus_previous(&self) {
        self.focus_manager().focus_previous();
    }

    pub fn focused(&self) -> Option<Arc<dyn CanvasObject>> {
        self.focus_manager().focused()
    }

    pub fn unfocus(&self) {
        self.focus_manager().focus(None);
    }

    pub fn padded(&self) -> bool {
        self.read().padded
    }

    pub fn set_padded(&self, padded: bool) {
        let size = {
            let mut props = self.write();
            props.padded = padded;
            props.size
        };
        self.resize(size);
    }

    /// 整个画布都可交互，没有边缘留白
    pub fn interactive_area(&self) -> (Position, Size) {
        (Position::ZERO, self.size())
    }

    // 只保存处理函数；framebuffer 后端没有输入源。
    pub fn set_on_typed_key(&self, handler: impl Fn(&KeyEvent) + Send + Sync + 'static) {
        self.write().on_typed_key = Some(Arc::new(handler));
    }

    pub fn on_typed_key(&self) -> Option<KeyHandler> {
        self.read().on_typed_key.clone()
    }

    pub fn set_on_typed_rune(&self, handler: impl Fn(char) + Send + Sync + 'static) {
        self.write().on_typed_rune = Some(Arc::new(handler));
    }

    pub fn on_typed_rune(&self) -> Option<RuneHandler> {
        self.read().on_typed_rune.clone()
    }

    pub fn pixel_coordinate_for_position(&self, pos: Position) -> (i32, i32) {
        let scale = self.scale();
        ((pos.x * scale) as i32, (pos.y * scale) as i32)
    }

    /// 请求重绘，对象参数只用于满足工具包接口
    pub fn refresh(&self, _obj: &Arc<dyn CanvasObject>) {
        self.set_dirty(true);
    }

    /// 调整画布大小，并把新尺寸传递给内容和浮层
    pub fn resize(&self, size: Size) {
        let (content, overlays, padded) = {
            let mut props = self.write();
            props.size = size;
            (props.content.clone(), props.overlays.list(), props.padded)
        };
        self.set_dirty(true);

        for overlay in overlays {
            overlay.resize(size);
        }
        let Some(content) = content else {
            return;
        };
        if padded {
            let p = self.settings.padding();
            content.resize(size.subtract(Size::new(p * 2.0, p * 2.0)));
            content.move_to(Position::new(p, p));
        } else {
            content.resize(size);
            content.move_to(Position::ZERO);
        }
    }

    pub fn size(&self) -> Size {
        self.read().size
    }

    pub fn scale(&self) -> f32 {
        self.read().scale
    }

    pub fn set_scale(&self, scale: f32) {
        self.write().scale = scale;
        self.set_dirty(true);
    }

    /// 内容在前，浮层按从下到上的顺序在后
    pub fn object_trees(&self) -> Vec<Arc<dyn CanvasObject>> {
        let props = self.read();
        let mut trees = Vec::with_capacity(props.overlays.list().len() + 1);
        if let Some(content) = &props.content {
            trees.push(content.clone());
        }
        trees.extend(props.overlays.list());
        trees
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        *self.dirty.lock().unwrap_or_else(|e| e.into_inner()) = dirty;
    }
}

fn scale_int(v: f32, scale: f32) -> u32 {
    (v * scale).round().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::Color;
    use crate::toolkit::testing::TestObject;
    use crate::toolkit::ThemeSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn canvas() -> Canvas {
        Canvas::new(None, Arc::new(ThemeSettings::new(4.0, Color::rgb(1, 2, 3))))
    }

    #[test]
    fn set_content_lays_out_with_padding() {
        let c = canvas();
        let obj = TestObject::new(Size::new(100.0, 50.0));
        c.set_content(Some(obj.clone()));

        assert!(c.is_dirty());
        assert_eq!(c.size(), Size::new(108.0, 58.0));
        assert_eq!(obj.size(), Size::new(100.0, 50.0));
        assert_eq!(obj.position(), Position::new(4.0, 4.0));
    }

    #[test]
    fn unpadded_content_fills_canvas() {
        let c = canvas();
        let obj = TestObject::new(Size::new(20.0, 20.0));
        c.set_content(Some(obj.clone()));
        c.set_padded(false);
        c.resize(Size::new(64.0, 32.0));

        assert_eq!(obj.size(), Size::new(64.0, 32.0));
        assert_eq!(obj.position(), Position::ZERO);
    }

    #[test]
    fn mutations_mark_dirty() {
        let c = canvas();
        assert!(!c.is_dirty());
        c.set_scale(2.0);
        assert!(c.is_dirty());

        c.set_dirty(false);
        c.resize(Size::new(5.0, 5.0));
        assert!(c.is_dirty());

        c.set_dirty(false);
        let obj: Arc<dyn CanvasObject> = TestObject::new(Size::ZERO);
        c.refresh(&obj);
        assert!(c.is_dirty());
    }

    #[test]
    fn capture_falls_back_to_theme_background() {
        let c = canvas();
        c.resize(Size::new(3.0, 2.0));
        c.set_scale(2.0);
        let img = c.capture();
        assert_eq!((img.width(), img.height()), (6, 4));
        assert_eq!(img.pixel(5, 3), Color::rgb(1, 2, 3));
    }

    #[test]
    fn overlay_focus_takes_priority() {
        let c = canvas();
        let a = TestObject::focusable(Size::ZERO);
        let b = TestObject::focusable(Size::ZERO);
        let root = TestObject::with_children(vec![
            a.clone() as Arc<dyn CanvasObject>,
            b.clone() as Arc<dyn CanvasObject>,
        ]);
        c.set_content(Some(root));

        c.focus_next();
        assert!(a.focused.load(Ordering::SeqCst));
        c.focus_next();
        assert!(b.focused.load(Ordering::SeqCst));
        assert!(!a.focused.load(Ordering::SeqCst));

        let popup_item = TestObject::focusable(Size::ZERO);
        let popup: Arc<dyn CanvasObject> =
            TestObject::with_children(vec![popup_item.clone() as Arc<dyn CanvasObject>]);
        c.add_overlay(popup.clone());
        assert_eq!(popup.size(), c.size());
        c.focus_next();
        assert!(popup_item.focused.load(Ordering::SeqCst));
        assert!(b.focused.load(Ordering::SeqCst));

        c.remove_overlay(&popup);
        assert!(c.top_overlay().is_none());
        c.focus_previous();
        assert!(a.focused.load(Ordering::SeqCst));
        c.unfocus();
        assert!(c.focused().is_none());
    }

    #[test]
    fn object_trees_lists_content_then_overlays() {
        let c = canvas();
        let content: Arc<dyn CanvasObject> = TestObject::new(Size::ZERO);
        let overlay: Arc<dyn CanvasObject> = TestObject::new(Size::ZERO);
        c.set_content(Some(content.clone()));
        c.add_overlay(overlay.clone());

        let trees = c.object_trees();
        assert_eq!(trees.len(), 2);
        assert!(same_object(&trees[0], &content));
        assert!(same_object(&trees[1], &overlay));
    }

    #[test]
    fn replacing_content_resets_focus() {
        let c = canvas();
        let a = TestObject::focusable(Size::ZERO);
        c.set_content(Some(a.clone()));
        c.focus(a.clone());
        assert!(c.focused().is_some());

        c.set_content(Some(TestObject::new(Size::ZERO)));
        assert!(c.focused().is_none());
    }

    #[test]
    fn interactive_area_covers_whole_canvas() {
        let c = canvas();
        c.resize(Size::new(320.0, 240.0));
        assert_eq!(c.interactive_area(), (Position::ZERO, Size::new(320.0, 240.0)));
    }

    #[test]
    fn typed_handlers_are_stored() {
        let c = canvas();
        assert!(c.on_typed_key().is_none());
        assert!(c.on_typed_rune().is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let keys = hits.clone();
        c.set_on_typed_key(move |ev| {
            assert_eq!(ev.name, "Return");
            keys.fetch_add(1, Ordering::SeqCst);
        });
        let runes = hits.clone();
        c.set_on_typed_rune(move |r| {
            assert_eq!(r, 'x');
            runes.fetch_add(10, Ordering::SeqCst);
        });

        c.on_typed_key().unwrap()(&KeyEvent { name: "Return".into() });
        c.on_typed_rune().unwrap()('x');
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert!(!c.is_dirty());
    }
}
