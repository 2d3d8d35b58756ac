//! 驱动、配置构建器与主循环。
//!
//! 两个循环:
//! * 主循环 (控制循环) 运行在调用 [`Driver::run`] 的线程上，处理跨线程调用和生命周期。
//! * 绘制循环运行在专用线程上，独占 Framebuffer 设备并按固定帧率重绘脏窗口。
//!
//! 设备只在绘制线程上被访问，这是它不需要内部锁的唯一原因。

mod draw;

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Once, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::canvas::Canvas;
use crate::error::Error;
use crate::linuxfb::fbio::{self, Ioctl, ModeControl, TerminalMode};
use crate::linuxfb::OpenMode;
use crate::pixels::PixelFormat;
use crate::toolkit::{
    estimate_text_size, same_object, CanvasObject, Device, FontMeasurer, Position, Settings,
    Size, SoftwarePainter, TextStyle, ThemeSettings,
};
use crate::window::Window;

pub(crate) use self::draw::DrawMessage;

pub const DEFAULT_FRAMEBUFFER: &str = "/dev/fb0";
/// 16-bpp 模式下强制设置的分辨率
pub const DEFAULT_RESOLUTION: (u32, u32) = (640, 512);
const DEFAULT_FRAME_RATE: u32 = 60;

/// 在循环线程上执行的无参任务
pub(crate) type Task = Box<dyn FnOnce() + Send>;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<Option<LoopId>> = const { Cell::new(None) };
}

/// 循环身份令牌，在循环启动的线程上登记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopId(u64);

impl LoopId {
    fn next() -> Self {
        LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn current() -> Option<LoopId> {
        CURRENT_LOOP.with(|c| c.get())
    }

    /// 把当前线程标记为该循环，guard 释放时恢复
    pub(crate) fn enter(self) -> LoopGuard {
        let previous = CURRENT_LOOP.with(|c| c.replace(Some(self)));
        LoopGuard { previous }
    }
}

pub(crate) struct LoopGuard {
    previous: Option<LoopId>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|c| c.set(self.previous));
    }
}

/// 单个循环的入队端
///
/// `running` 锁在发送期间一直持有，所以循环停止并清空队列之后不会再有新消息进来。
pub(crate) struct Dispatcher<M> {
    id: LoopId,
    tx: Sender<M>,
    running: Mutex<bool>,
}

impl<M: Send> Dispatcher<M> {
    fn new() -> (Self, Receiver<M>) {
        let (tx, rx) = channel();
        (Self { id: LoopId::next(), tx, running: Mutex::new(false) }, rx)
    }

    fn running(&self) -> MutexGuard<'_, bool> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running()
    }

    /// 循环未运行时把消息原样退回
    pub(crate) fn submit(&self, msg: M) -> Result<(), M> {
        let running = self.running();
        if !*running {
            return Err(msg);
        }
        self.tx.send(msg).map_err(|e| e.0)
    }

    pub(crate) fn start(&self) {
        *self.running() = true;
    }

    /// 标记停止，并取出仍在队列中的消息
    pub(crate) fn stop(&self, rx: &Receiver<M>) -> Vec<M> {
        let mut running = self.running();
        *running = false;
        rx.try_iter().collect()
    }
}

/// 主循环的线程亲和性策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAffinity {
    /// 只允许在进程的初始线程上运行 (默认)
    InitialThread,
    /// 任何线程都可以，用于嵌入到其他程序或测试
    Any,
}

fn is_initial_thread() -> bool {
    // 主线程的 tid 与 pid 相同
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    tid == unsafe { libc::getpid() }
}

/// 设备相关配置
#[derive(Clone)]
pub(crate) struct DeviceConfig {
    pub path: PathBuf,
    pub format: PixelFormat,
    pub mode: OpenMode,
    pub control: Arc<dyn ModeControl>,
}

/// Linux Framebuffer 驱动构建器
pub struct DriverBuilder {
    fb_path: Option<PathBuf>,
    format: Option<PixelFormat>,
    open_mode: Option<OpenMode>,
    frame_rate: u32,
    tty_path: Option<PathBuf>,
    quit_on_signal: bool,
    affinity: ThreadAffinity,
    painter: Option<Arc<dyn SoftwarePainter>>,
    settings: Option<Arc<dyn Settings>>,
    font_measurer: Option<Arc<dyn FontMeasurer>>,
    mode_control: Arc<dyn ModeControl>,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self {
            fb_path: None,
            format: None,
            open_mode: None,
            frame_rate: DEFAULT_FRAME_RATE,
            tty_path: None,
            quit_on_signal: true,
            affinity: ThreadAffinity::InitialThread,
            painter: None,
            settings: None,
            font_measurer: None,
            mode_control: Arc::new(Ioctl),
        }
    }
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置 Framebuffer 设备路径 (例如 "/dev/fb1")
    /// 如果不设置，默认尝试使用环境变量 `LINUXFB_DEVICE`，然后是 /dev/fb0
    pub fn with_framebuffer(mut self, path: impl Into<PathBuf>) -> Self {
        self.fb_path = Some(path.into());
        self
    }

    /// 设置期望的像素格式。
    /// 如果不设置，读取环境变量 `LINUXFB_FORMAT` (`rgb565` 或 `argb8888`)，默认 RGB565。
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// 设置模式协商策略。
    /// 默认: RGB565 强制设置为 640x512，其它格式只做校验。
    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = Some(mode);
        self
    }

    /// 主循环与绘制循环的节拍频率 (默认 60 Hz)
    pub fn with_frame_rate(mut self, hz: u32) -> Self {
        self.frame_rate = hz.max(1);
        self
    }

    /// 运行期间把该 TTY 切换到图形模式，退出时恢复文本模式
    pub fn with_tty(mut self, path: impl Into<PathBuf>) -> Self {
        self.tty_path = Some(path.into());
        self
    }

    /// 收到 SIGINT/SIGTERM 时请求退出事件循环 (默认开启)
    pub fn with_quit_on_signal(mut self, enable: bool) -> Self {
        self.quit_on_signal = enable;
        self
    }

    pub fn with_thread_affinity(mut self, affinity: ThreadAffinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_painter(mut self, painter: Arc<dyn SoftwarePainter>) -> Self {
        self.painter = Some(painter);
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_font_measurer(mut self, measurer: Arc<dyn FontMeasurer>) -> Self {
        self.font_measurer = Some(measurer);
        self
    }

    /// 替换模式控制请求的实现 (默认直接调用 ioctl)
    pub fn with_mode_control(mut self, control: Arc<dyn ModeControl>) -> Self {
        self.mode_control = control;
        self
    }

    fn resolve_format(&self) -> PixelFormat {
        if let Some(format) = self.format {
            return format;
        }
        match std::env::var("LINUXFB_FORMAT").ok().as_deref() {
            None | Some("rgb565") => PixelFormat::RGB565,
            Some("argb8888") => PixelFormat::ARGB8888,
            Some(other) => {
                tracing::warn!("未知的 LINUXFB_FORMAT: {}，使用 rgb565", other);
                PixelFormat::RGB565
            }
        }
    }

    /// 构建驱动。设备在第一次 `run()` 时才会打开。
    pub fn build(self) -> Driver {
        let path = self
            .fb_path
            .clone()
            .or_else(|| std::env::var("LINUXFB_DEVICE").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FRAMEBUFFER));
        let format = self.resolve_format();
        let mode = self.open_mode.unwrap_or(if format == PixelFormat::RGB565 {
            OpenMode::Force { width: DEFAULT_RESOLUTION.0, height: DEFAULT_RESOLUTION.1 }
        } else {
            OpenMode::Validate
        });

        let (main, main_rx) = Dispatcher::new();
        let (draw, draw_rx) = Dispatcher::new();
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(ThemeSettings::default()) as Arc<dyn Settings>);

        let ctx = Arc::new(DriverContext {
            device: DeviceConfig { path, format, mode, control: self.mode_control },
            frame_period: Duration::from_secs(1) / self.frame_rate,
            tty_path: self.tty_path,
            quit_on_signal: self.quit_on_signal,
            affinity: self.affinity,
            painter: self.painter,
            settings,
            font_measurer: self.font_measurer,
            windows: RwLock::new(Vec::new()),
            main,
            main_rx: Mutex::new(main_rx),
            draw,
            draw_rx: Mutex::new(Some(draw_rx)),
            draw_thread: Mutex::new(None),
            quit: AtomicBool::new(false),
            tty: Mutex::new(None),
            signal_once: Once::new(),
        });

        // 设置变化交给绘制线程处理；绘制循环未运行时就地处理
        let weak = Arc::downgrade(&ctx);
        ctx.settings.add_change_listener(Box::new(move || {
            if let Some(ctx) = weak.upgrade() {
                if ctx.draw.submit(DrawMessage::SettingsChanged).is_err() {
                    draw::apply_settings_change(&ctx);
                }
            }
        }));

        Driver { ctx }
    }
}

/// 驱动实例的全部共享状态
///
/// 窗口列表、循环队列与退出标志都挂在这里，而不是进程级的全局变量。
pub(crate) struct DriverContext {
    device: DeviceConfig,
    frame_period: Duration,
    tty_path: Option<PathBuf>,
    quit_on_signal: bool,
    affinity: ThreadAffinity,
    painter: Option<Arc<dyn SoftwarePainter>>,
    settings: Arc<dyn Settings>,
    font_measurer: Option<Arc<dyn FontMeasurer>>,
    windows: RwLock<Vec<Arc<Window>>>,
    main: Dispatcher<Task>,
    main_rx: Mutex<Receiver<Task>>,
    draw: Dispatcher<DrawMessage>,
    /// 绘制线程运行期间由线程持有
    draw_rx: Mutex<Option<Receiver<DrawMessage>>>,
    draw_thread: Mutex<Option<JoinHandle<Receiver<DrawMessage>>>>,
    quit: AtomicBool,
    tty: Mutex<Option<File>>,
    signal_once: Once,
}

impl DriverContext {
    /// 窗口列表的快照 (按创建顺序)
    pub(crate) fn window_list(&self) -> Vec<Arc<Window>> {
        self.windows.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn remove_window(&self, window: &Window) {
        self.windows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|w| !std::ptr::eq(Arc::as_ptr(w), window));
    }

    fn check_thread_affinity(&self) {
        if self.affinity == ThreadAffinity::InitialThread && !is_initial_thread() {
            tracing::error!("run() 或 show_and_run() 必须在进程的初始线程上调用");
            panic!("run() or show_and_run() must be called from the process's initial thread");
        }
    }

    fn install_signal_handler(self: &Arc<Self>) {
        if !self.quit_on_signal {
            return;
        }
        self.signal_once.call_once(|| {
            let weak = Arc::downgrade(self);
            let result = ctrlc::set_handler(move || {
                tracing::info!("接收到退出信号，正在停止事件循环...");
                if let Some(ctx) = weak.upgrade() {
                    ctx.quit.store(true, Ordering::Release);
                }
            });
            if let Err(e) = result {
                tracing::debug!("无法注册信号处理器: {}", e);
            }
        });
    }

    fn enter_graphics_mode(&self) {
        let Some(path) = &self.tty_path else {
            return;
        };
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                if let Err(e) = fbio::set_terminal_mode(&file, TerminalMode::Graphics) {
                    tracing::warn!("无法将 TTY 切换到图形模式: {}", e);
                } else {
                    tracing::info!("TTY {:?} 已切换到图形模式 (KD_GRAPHICS)。", path);
                }
                *self.tty.lock().unwrap_or_else(|e| e.into_inner()) = Some(file);
            }
            Err(e) => tracing::warn!("无法打开 TTY {:?}: {}。fbcon 光标可能会干扰 UI。", path, e),
        }
    }

    fn restore_text_mode(&self) {
        if let Some(tty) = self.tty.lock().unwrap_or_else(|e| e.into_inner()).take() {
            tracing::info!("正在恢复 TTY 到文本模式...");
            if let Err(e) = fbio::set_terminal_mode(&tty, TerminalMode::Text) {
                tracing::error!("无法恢复 TTY 到文本模式: {}", e);
            }
        }
    }

    fn run_main_loop(self: &Arc<Self>) -> Result<(), Error> {
        let rx = match self.main_rx.try_lock() {
            Ok(rx) => rx,
            Err(std::sync::TryLockError::WouldBlock) => return Err(Error::AlreadyRunning),
            Err(std::sync::TryLockError::Poisoned(e)) => e.into_inner(),
        };
        self.install_signal_handler();
        self.enter_graphics_mode();

        if let Err(e) = draw::start(self) {
            tracing::error!("无法启动绘制循环: {}", e);
            self.restore_text_mode();
            self.quit.store(false, Ordering::Release);
            return Err(e);
        }

        let _guard = self.main.id.enter();
        self.main.start();
        tracing::info!("事件循环已启动");

        let period = self.frame_period;
        let mut next_tick = Instant::now() + period;
        while !self.quit.load(Ordering::Acquire) {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // fbdev 没有输入事件源，节拍只用于检查退出标志
            if Instant::now() >= next_tick {
                next_tick = draw::advance(next_tick, period);
            }
        }

        for task in self.main.stop(&rx) {
            task();
        }
        draw::stop(self);
        self.restore_text_mode();
        // 退出请求只作用于这一次运行
        self.quit.store(false, Ordering::Release);
        tracing::info!("事件循环已退出");
        Ok(())
    }
}

impl Drop for DriverContext {
    fn drop(&mut self) {
        self.restore_text_mode();
    }
}

/// Framebuffer 驱动的公开句柄，可廉价克隆
#[derive(Clone)]
pub struct Driver {
    ctx: Arc<DriverContext>,
}

impl Driver {
    pub(crate) fn from_context(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    pub fn settings(&self) -> &Arc<dyn Settings> {
        &self.ctx.settings
    }

    pub fn device(&self) -> Device {
        Device
    }

    /// 创建并登记一个新窗口。所有窗口共享同一块屏幕。
    pub fn create_window(&self, title: &str) -> Arc<Window> {
        let canvas = Canvas::new(self.ctx.painter.clone(), self.ctx.settings.clone());
        let window = Arc::new(Window::new(title, canvas, Arc::downgrade(&self.ctx)));
        self.ctx
            .windows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(window.clone());
        window
    }

    pub fn all_windows(&self) -> Vec<Arc<Window>> {
        self.ctx.window_list()
    }

    /// 查找包含 `obj` 的画布。
    ///
    /// 找不到时退回到当前聚焦窗口的画布，再退回到最后创建的窗口。
    pub fn canvas_for_object(&self, obj: &Arc<dyn CanvasObject>) -> Option<Arc<Canvas>> {
        fn contains(tree: &Arc<dyn CanvasObject>, target: &Arc<dyn CanvasObject>) -> bool {
            same_object(tree, target) || tree.children().iter().any(|c| contains(c, target))
        }

        let windows = self.ctx.window_list();
        windows
            .iter()
            .find(|w| w.canvas().object_trees().iter().any(|t| contains(t, obj)))
            .or_else(|| windows.iter().find(|w| w.is_focused()))
            .or_else(|| windows.last())
            .map(|w| w.canvas().clone())
    }

    /// 对象在屏幕上的绝对位置: 路径上所有祖先位置之和
    pub fn absolute_position_for_object(&self, obj: &Arc<dyn CanvasObject>) -> Position {
        fn find(
            node: &Arc<dyn CanvasObject>,
            target: &Arc<dyn CanvasObject>,
            offset: Position,
        ) -> Option<Position> {
            let pos = offset.add(node.position());
            if same_object(node, target) {
                return Some(pos);
            }
            node.children().iter().find_map(|c| find(c, target, pos))
        }

        let Some(canvas) = self.canvas_for_object(obj) else {
            return Position::ZERO;
        };
        canvas
            .object_trees()
            .iter()
            .find_map(|tree| find(tree, obj, Position::ZERO))
            .unwrap_or(Position::ZERO)
    }

    /// 测量文本渲染后的尺寸
    pub fn rendered_text_size(&self, text: &str, size: f32, style: TextStyle) -> Size {
        match &self.ctx.font_measurer {
            Some(measurer) => measurer.measure_text(text, size, style),
            None => estimate_text_size(text, size),
        }
    }

    /// 运行事件循环，阻塞直到 [`Driver::quit`] 被调用。
    ///
    /// 第一次运行时在绘制线程上打开设备，打开失败直接返回错误。
    ///
    /// # Panics
    /// 在 `ThreadAffinity::InitialThread` 策略下从其它线程调用时 panic。
    pub fn run(&self) -> Result<(), Error> {
        self.ctx.check_thread_affinity();
        self.ctx.run_main_loop()
    }

    /// 请求退出事件循环，可在任意线程调用
    pub fn quit(&self) {
        tracing::debug!("请求退出事件循环");
        self.ctx.quit.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.ctx.main.is_running()
    }

    /// 在主循环上执行 `f` 并等待其完成。
    ///
    /// 主循环未运行、或已经在主循环上时直接执行。
    pub fn run_on_main<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if LoopId::current() == Some(self.ctx.main.id) {
            return Ok(f());
        }
        let (done_tx, done_rx) = channel();
        let task: Task = Box::new(move || {
            let _ = done_tx.send(f());
        });
        if let Err(task) = self.ctx.main.submit(task) {
            task();
        }
        done_rx.recv().map_err(|_| Error::EventLoopTerminated)
    }

    /// 在绘制线程上执行 `f` 并等待其完成。
    ///
    /// 总是排队执行；只有在绘制线程自身上调用时才直接执行，以免自锁。
    pub fn run_on_draw<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if LoopId::current() == Some(self.ctx.draw.id) {
            return Ok(f());
        }
        let (done_tx, done_rx) = channel();
        let task: Task = Box::new(move || {
            let _ = done_tx.send(f());
        });
        self.ctx
            .draw
            .submit(DrawMessage::Call(task))
            .map_err(|_| Error::EventLoopTerminated)?;
        done_rx.recv().map_err(|_| Error::EventLoopTerminated)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::linuxfb::testing::{FakeControl, FakeNode};

    /// 基于模拟设备的驱动构建器
    pub fn fake_driver(width: u32, height: u32) -> (DriverBuilder, FakeNode, Arc<FakeControl>) {
        let node = FakeNode::new((width * height * 4) as usize);
        let control = Arc::new(FakeControl::argb8888(width, height));
        let builder = DriverBuilder::new()
            .with_framebuffer(&node.path)
            .with_pixel_format(PixelFormat::ARGB8888)
            .with_open_mode(OpenMode::Validate)
            .with_mode_control(control.clone())
            .with_thread_affinity(ThreadAffinity::Any)
            .with_quit_on_signal(false)
            .with_frame_rate(200);
        (builder, node, control)
    }

    /// 在后台线程上运行事件循环，等到它真正启动
    pub fn spawn_run(driver: &Driver) -> std::thread::JoinHandle<Result<(), Error>> {
        let runner = driver.clone();
        let handle = std::thread::spawn(move || runner.run());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !driver.is_running() {
            assert!(Instant::now() < deadline, "event loop did not start");
            std::thread::sleep(Duration::from_millis(1));
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::linuxfb::testing::bitfield;
    use crate::toolkit::testing::TestObject;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_on_main_executes_inline_when_not_running() {
        let driver = DriverBuilder::new().with_quit_on_signal(false).build();
        let caller = std::thread::current().id();
        let ran_on = driver.run_on_main(move || std::thread::current().id()).unwrap();
        assert_eq!(ran_on, caller);
    }

    #[test]
    fn run_on_draw_fails_without_draw_loop() {
        let driver = DriverBuilder::new().with_quit_on_signal(false).build();
        assert!(matches!(driver.run_on_draw(|| ()), Err(Error::EventLoopTerminated)));
    }

    #[test]
    fn concurrent_calls_are_serviced_exactly_once() {
        let (builder, _node, _control) = fake_driver(8, 8);
        let driver = builder.build();
        let runner = spawn_run(&driver);

        let main_log = Arc::new(Mutex::new(Vec::new()));
        let draw_log = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let driver = driver.clone();
                let main_log = main_log.clone();
                let draw_log = draw_log.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = t * 100 + i;
                        let log = main_log.clone();
                        let on = driver.run_on_main(move || {
                            log.lock().unwrap().push(id);
                            std::thread::current().id()
                        });
                        assert_ne!(on.unwrap(), std::thread::current().id());
                        assert!(main_log.lock().unwrap().contains(&id));

                        let log = draw_log.clone();
                        driver.run_on_draw(move || log.lock().unwrap().push(id)).unwrap();
                        assert!(draw_log.lock().unwrap().contains(&id));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        driver.quit();
        runner.join().unwrap().unwrap();

        for log in [main_log, draw_log] {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 200);
            assert_eq!(log.iter().collect::<HashSet<_>>().len(), 200);
        }
    }

    #[test]
    fn calls_from_one_thread_keep_submission_order() {
        let (builder, _node, _control) = fake_driver(8, 8);
        let driver = builder.build();
        let runner = spawn_run(&driver);

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let main_log = log.clone();
            driver.run_on_main(move || main_log.lock().unwrap().push(i)).unwrap();
        }
        driver.quit();
        runner.join().unwrap().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn nested_dispatch_does_not_deadlock() {
        let (builder, _node, _control) = fake_driver(8, 8);
        let driver = builder.build();
        let runner = spawn_run(&driver);

        let inner = driver.clone();
        let value = driver
            .run_on_main(move || {
                let again = inner.clone();
                let draw = inner.run_on_draw(move || again.run_on_draw(|| 7).unwrap());
                inner.run_on_main(move || draw.unwrap() * 6).unwrap()
            })
            .unwrap();
        assert_eq!(value, 42);

        driver.quit();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn device_open_failure_is_returned_from_run() {
        let (builder, node, control) = fake_driver(8, 8);
        control.set_layout([bitfield(0, 8), bitfield(8, 8), bitfield(16, 8)]);
        let driver = builder.build();

        let err = driver.run().unwrap_err();
        assert!(matches!(
            err,
            Error::LinuxFb(crate::linuxfb::Error::UnsupportedColorModel { .. })
        ));
        assert!(!driver.is_running());
        assert!(!node.is_open());
    }

    #[test]
    fn quit_closes_device_and_run_can_restart() {
        let (builder, node, _control) = fake_driver(8, 8);
        let driver = builder.build();

        for _ in 0..2 {
            let runner = spawn_run(&driver);
            assert!(node.is_open());
            driver.quit();
            runner.join().unwrap().unwrap();
            assert!(!driver.is_running());
            assert!(!node.is_open());
        }
    }

    #[test]
    fn quit_before_run_is_honored_once() {
        let (builder, node, _control) = fake_driver(8, 8);
        let driver = builder.build();

        driver.quit();
        driver.run().unwrap();
        assert!(!driver.is_running());
        assert!(!node.is_open());

        // 请求已被上一次运行消费
        let runner = spawn_run(&driver);
        assert!(node.is_open());
        driver.quit();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn settings_change_while_stopped_dirties_windows() {
        struct CachingPainter(AtomicUsize);
        impl SoftwarePainter for CachingPainter {
            fn paint(&self, _canvas: &Canvas) -> crate::pixels::Image {
                crate::pixels::Image::new(1, 1, PixelFormat::ARGB8888)
            }
            fn clear_cache(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let painter = Arc::new(CachingPainter(AtomicUsize::new(0)));
        let settings = Arc::new(ThemeSettings::default());
        let driver = DriverBuilder::new()
            .with_quit_on_signal(false)
            .with_painter(painter.clone())
            .with_settings(settings.clone())
            .build();
        let window = driver.create_window("w");
        window.canvas().set_dirty(false);

        settings.set_theme(6.0, crate::pixels::Color::WHITE);
        assert!(window.canvas().is_dirty());
        assert_eq!(painter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_concurrent_run_is_refused() {
        let (builder, _node, _control) = fake_driver(8, 8);
        let driver = builder.build();
        let runner = spawn_run(&driver);

        assert!(matches!(driver.run(), Err(Error::AlreadyRunning)));
        driver.quit();
        runner.join().unwrap().unwrap();
    }

    #[test]
    #[should_panic(expected = "initial thread")]
    fn run_off_the_initial_thread_panics() {
        // 测试线程永远不是进程的初始线程
        let driver = DriverBuilder::new().with_quit_on_signal(false).build();
        let _ = driver.run();
    }

    #[test]
    fn canvas_and_position_lookup() {
        let driver = DriverBuilder::new().with_quit_on_signal(false).build();
        let first = driver.create_window("first");
        let second = driver.create_window("second");

        let leaf = TestObject::new(Size::new(4.0, 4.0));
        leaf.move_to(Position::new(3.0, 5.0));
        let group = TestObject::with_children(vec![leaf.clone() as Arc<dyn CanvasObject>]);
        first.set_content(group.clone());
        first.canvas().set_padded(false);
        group.move_to(Position::new(10.0, 20.0));

        let leaf_dyn: Arc<dyn CanvasObject> = leaf;
        let canvas = driver.canvas_for_object(&leaf_dyn).unwrap();
        assert!(Arc::ptr_eq(&canvas, first.canvas()));
        assert_eq!(driver.absolute_position_for_object(&leaf_dyn), Position::new(13.0, 25.0));

        let stray: Arc<dyn CanvasObject> = TestObject::new(Size::ZERO);
        second.request_focus();
        assert!(Arc::ptr_eq(&driver.canvas_for_object(&stray).unwrap(), second.canvas()));
        assert_eq!(driver.absolute_position_for_object(&stray), Position::ZERO);
    }

    #[test]
    fn text_size_uses_measurer_or_estimate() {
        struct Fixed;
        impl FontMeasurer for Fixed {
            fn measure_text(&self, text: &str, size: f32, _style: TextStyle) -> Size {
                Size::new(text.len() as f32 * size, size)
            }
        }

        let plain = DriverBuilder::new().with_quit_on_signal(false).build();
        assert!(!plain.device().has_keyboard());
        assert_eq!(
            plain.rendered_text_size("abcde", 10.0, TextStyle::default()),
            Size::new(30.0, 12.0)
        );

        let measured = DriverBuilder::new()
            .with_quit_on_signal(false)
            .with_font_measurer(Arc::new(Fixed))
            .build();
        assert_eq!(
            measured.rendered_text_size("ab", 3.0, TextStyle::default()),
            Size::new(6.0, 3.0)
        );
    }

    #[test]
    fn rgb565_defaults_to_forced_resolution() {
        let driver = DriverBuilder::new()
            .with_quit_on_signal(false)
            .with_pixel_format(PixelFormat::RGB565)
            .with_framebuffer("/dev/fb7")
            .build();
        let device = &driver.ctx.device;
        assert_eq!(device.path, PathBuf::from("/dev/fb7"));
        assert_eq!(device.mode, OpenMode::Force { width: 640, height: 512 });
    }
}
