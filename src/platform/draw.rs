//! 绘制循环: 独占设备，按固定节拍把脏窗口的画布推送到 Framebuffer。

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DriverContext, Task};
use crate::canvas::Canvas;
use crate::error::Error;
use crate::linuxfb::{self, Framebuffer};
use crate::pixels::Point;
use crate::window::Window;

pub(crate) enum DrawMessage {
    /// 跨线程调用，完成通知由任务自己负责
    Call(Task),
    /// 主题/设置变化
    SettingsChanged,
    /// 停止循环，关闭设备后回复
    Stop(Sender<()>),
}

/// 下一个节拍时间；落后太多时不追帧
pub(super) fn advance(next_tick: Instant, period: Duration) -> Instant {
    let now = Instant::now();
    let next = next_tick + period;
    if next < now {
        now + period
    } else {
        next
    }
}

/// 启动绘制线程并等待设备打开的结果
pub(super) fn start(ctx: &Arc<DriverContext>) -> Result<(), Error> {
    let mut thread = ctx.draw_thread.lock().unwrap_or_else(|e| e.into_inner());
    if thread.is_some() {
        return Ok(());
    }
    let rx = ctx
        .draw_rx
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .ok_or_else(|| Error::DrawThread("绘制队列已丢失".into()))?;

    let (ready_tx, ready_rx) = channel();
    let worker = Arc::clone(ctx);
    let handle = std::thread::Builder::new()
        .name("linuxfb-draw".into())
        .spawn(move || draw_loop(worker, rx, ready_tx))
        .map_err(|e| Error::DrawThread(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            *thread = Some(handle);
            Ok(())
        }
        Ok(Err(e)) => {
            reclaim(ctx, handle);
            Err(e)
        }
        Err(_) => {
            reclaim(ctx, handle);
            Err(Error::DrawThread("绘制线程在启动时退出".into()))
        }
    }
}

/// 让绘制循环退出，等待设备关闭
pub(super) fn stop(ctx: &Arc<DriverContext>) {
    let Some(handle) = ctx.draw_thread.lock().unwrap_or_else(|e| e.into_inner()).take() else {
        return;
    };
    let (ack_tx, ack_rx) = channel();
    // Stop 绕过 running 检查，循环在处理它之前一直是运行状态
    if ctx.draw.tx.send(DrawMessage::Stop(ack_tx)).is_ok() {
        let _ = ack_rx.recv();
    }
    reclaim(ctx, handle);
}

/// 收回线程持有的队列接收端，以便下一次 `run()` 重新启动
fn reclaim(ctx: &DriverContext, handle: std::thread::JoinHandle<Receiver<DrawMessage>>) {
    match handle.join() {
        Ok(rx) => *ctx.draw_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx),
        Err(_) => tracing::error!("绘制线程 panic，无法再次启动"),
    }
}

fn draw_loop(
    ctx: Arc<DriverContext>,
    rx: Receiver<DrawMessage>,
    ready: Sender<Result<(), Error>>,
) -> Receiver<DrawMessage> {
    let _guard = ctx.draw.id.enter();
    let config = &ctx.device;
    let mut device =
        match Framebuffer::open_with(&config.path, config.format, config.mode, &*config.control) {
            Ok(device) => device,
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return rx;
            }
        };
    ctx.draw.start();
    let _ = ready.send(Ok(()));
    tracing::debug!("绘制循环已启动");

    let period = ctx.frame_period;
    let mut next_tick = Instant::now() + period;
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(DrawMessage::Call(task)) => task(),
            Ok(DrawMessage::SettingsChanged) => apply_settings_change(&ctx),
            Ok(DrawMessage::Stop(ack)) => {
                for msg in ctx.draw.stop(&rx) {
                    if let DrawMessage::Call(task) = msg {
                        task();
                    }
                }
                if let Err(e) = device.close() {
                    tracing::warn!("关闭 Framebuffer 失败: {}", e);
                }
                let _ = ack.send(());
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // 队列一直有消息时也要按时重绘
        if Instant::now() >= next_tick {
            next_tick = advance(next_tick, period);
            redraw_windows(&ctx.window_list(), &mut device);
        }
    }
    tracing::debug!("绘制循环已退出");
    rx
}

/// 清空绘制器和字体缓存，并把所有窗口标记为脏
pub(super) fn apply_settings_change(ctx: &DriverContext) {
    if let Some(painter) = &ctx.painter {
        painter.clear_cache();
    }
    if let Some(measurer) = &ctx.font_measurer {
        measurer.clear_cache();
    }
    for window in ctx.window_list() {
        window.canvas().set_dirty(true);
    }
}

/// 重绘所有可见且脏的窗口，返回实际推送的窗口数
pub(crate) fn redraw_windows(windows: &[Arc<Window>], device: &mut Framebuffer) -> usize {
    let mut painted = 0;
    for window in windows {
        let (visible, canvas) = window.snapshot();
        if !visible || !canvas.is_dirty() {
            continue;
        }
        match repaint(&canvas, device) {
            Ok(()) => painted += 1,
            Err(e) => tracing::error!("窗口 {:?} 绘制失败: {}", window.title(), e),
        }
    }
    painted
}

/// 先清除脏标记再截取画布: 截取期间到来的刷新会留到下一帧，而不是被覆盖
fn repaint(canvas: &Canvas, device: &mut Framebuffer) -> Result<(), linuxfb::Error> {
    canvas.set_dirty(false);
    let image = canvas.capture();
    if let Err(e) = device.draw(image.bounds(), &image, Point::ZERO) {
        canvas.set_dirty(true);
        return Err(e);
    }
    Ok(())
}
