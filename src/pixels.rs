//! 像素格式描述符、颜色与内存图像。
//!
//! 负责把非预乘的 RGBA 颜色编码为 Framebuffer 的具体像素格式，以及反向解码。

use crate::linuxfb::fbio::PixelLayout;

/// 非预乘 (straight alpha) 的 8-bit RGBA 颜色
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(0xff, 0xff, 0xff);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue, alpha: 0xff }
    }

    pub const fn rgba(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self { red, green, blue, alpha }
    }

    pub fn is_transparent(&self) -> bool {
        self.alpha == 0
    }
}

/// 像素值中单个颜色通道的位置 (以位为单位，从最低位算起)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub offset: u32,
    pub length: u32,
}

impl Channel {
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    fn mask(&self) -> u32 {
        if self.length >= 32 {
            u32::MAX
        } else {
            (1u32 << self.length) - 1
        }
    }

    fn encode(&self, value: u8) -> u32 {
        ((value as u32) >> (8 - self.length)) << self.offset
    }

    /// 低位补零，不做位复制: 5-bit 的 31 还原为 248。
    fn decode(&self, raw: u32) -> u8 {
        (((raw >> self.offset) & self.mask()) << (8 - self.length)) as u8
    }
}

/// 像素格式描述符
///
/// 内存中按小端序存放，`bits_per_pixel` 只能是 16 或 32。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u32,
    pub red: Channel,
    pub green: Channel,
    pub blue: Channel,
    /// 为 `None` 时读回的颜色始终不透明
    pub alpha: Option<Channel>,
}

impl PixelFormat {
    /// 16-bpp RGB565 小端序 (嵌入式常用)
    pub const RGB565: PixelFormat = PixelFormat {
        bits_per_pixel: 16,
        red: Channel::new(11, 5),
        green: Channel::new(5, 6),
        blue: Channel::new(0, 5),
        alpha: None,
    };

    /// 32-bpp, 内存序: BB GG RR AA
    pub const ARGB8888: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        red: Channel::new(16, 8),
        green: Channel::new(8, 8),
        blue: Channel::new(0, 8),
        alpha: Some(Channel::new(24, 8)),
    };

    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// 驱动上报的 R/G/B 布局是否与本格式完全一致。
    ///
    /// 透明通道不参与比较，很多驱动即使写入 alpha 字节也不上报它。
    pub fn matches(&self, layout: &PixelLayout) -> bool {
        let same = |expected: &Channel, found: &crate::linuxfb::fbio::PixelLayoutChannel| {
            found.offset == expected.offset && found.length == expected.length && !found.msb_right
        };
        same(&self.red, &layout.red) && same(&self.green, &layout.green) && same(&self.blue, &layout.blue)
    }

    pub fn encode(&self, color: Color) -> u32 {
        let mut raw = self.red.encode(color.red)
            | self.green.encode(color.green)
            | self.blue.encode(color.blue);
        if let Some(alpha) = &self.alpha {
            raw |= alpha.encode(color.alpha);
        }
        raw
    }

    pub fn decode(&self, raw: u32) -> Color {
        Color {
            red: self.red.decode(raw),
            green: self.green.decode(raw),
            blue: self.blue.decode(raw),
            alpha: self.alpha.map_or(0xff, |a| a.decode(raw)),
        }
    }

    /// 把 `color` 写入 `dst` 开头的一个像素
    pub fn write(&self, dst: &mut [u8], color: Color) {
        let raw = self.encode(color);
        match self.bytes_per_pixel() {
            2 => dst[..2].copy_from_slice(&(raw as u16).to_le_bytes()),
            _ => dst[..4].copy_from_slice(&raw.to_le_bytes()),
        }
    }

    /// 从 `src` 开头读取一个像素
    pub fn read(&self, src: &[u8]) -> Color {
        let raw = match self.bytes_per_pixel() {
            2 => u16::from_le_bytes([src[0], src[1]]) as u32,
            _ => u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
        };
        self.decode(raw)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 半开区间矩形 `[x0, x1) × [y0, y1)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Rect {
    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y1 - self.y0).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x0 && p.x < self.x1 && p.y >= self.y0 && p.y < self.y1
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect::new(
            self.x0.max(other.x0),
            self.y0.max(other.y0),
            self.x1.min(other.x1),
            self.y1.min(other.y1),
        );
        if r.is_empty() {
            Rect::default()
        } else {
            r
        }
    }
}

/// 行优先、紧密排列的内存图像，软件绘制器的输出
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// 创建全零 (全透明或黑色) 图像
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self { width, height, format, data: vec![0; len] }
    }

    pub fn filled(width: u32, height: u32, format: PixelFormat, color: Color) -> Self {
        let mut image = Self::new(width, height, format);
        image.fill(color);
        image
    }

    /// 包装已有的像素数据，长度不符时返回 `None`
    pub fn from_raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        (data.len() == len).then_some(Self { width, height, format, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// 每行字节数
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    fn offset(&self, x: i32, y: i32) -> Option<usize> {
        if !self.bounds().contains(Point::new(x, y)) {
            return None;
        }
        Some(y as usize * self.stride() + x as usize * self.format.bytes_per_pixel())
    }

    /// 越界返回全透明
    pub fn pixel(&self, x: i32, y: i32) -> Color {
        match self.offset(x, y) {
            Some(i) => self.format.read(&self.data[i..]),
            None => Color::TRANSPARENT,
        }
    }

    /// 越界写入被忽略
    pub fn set_pixel(&mut self, x: i32, y: i32, color: Color) {
        if let Some(i) = self.offset(x, y) {
            self.format.write(&mut self.data[i..], color);
        }
    }

    pub fn fill(&mut self, color: Color) {
        let bpp = self.format.bytes_per_pixel();
        let mut encoded = [0u8; 4];
        self.format.write(&mut encoded, color);
        for px in self.data.chunks_exact_mut(bpp) {
            px.copy_from_slice(&encoded[..bpp]);
        }
    }
}
