use std::sync::Arc;

use canvas_backend_linuxfb::canvas::Canvas;
use canvas_backend_linuxfb::pixels::{Color, Image, PixelFormat};
use canvas_backend_linuxfb::toolkit::SoftwarePainter;
use canvas_backend_linuxfb::DriverBuilder;

/// 纵向渐变，顶部红色，底部蓝色
struct Gradient;

impl SoftwarePainter for Gradient {
    fn paint(&self, canvas: &Canvas) -> Image {
        let size = canvas.size();
        let (width, height) = (size.width as u32, size.height.max(1.0) as u32);
        let mut image = Image::new(width, height, PixelFormat::ARGB8888);
        for y in 0..height {
            let t = (y * 255 / height) as u8;
            for x in 0..width {
                image.set_pixel(x as i32, y as i32, Color::rgb(255 - t, 0, t));
            }
        }
        image
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt::init();

    let driver = DriverBuilder::new().with_painter(Arc::new(Gradient)).build();
    let window = driver.create_window("solid");
    window.set_full_screen(true);
    window.resize(canvas_backend_linuxfb::toolkit::Size::new(640.0, 512.0));

    println!("UI 已启动。按 Ctrl+C 退出。");
    if let Err(e) = window.show_and_run() {
        eprintln!("错误: 无法运行 Framebuffer 后端: {}", e);
    }

    Ok(())
}
