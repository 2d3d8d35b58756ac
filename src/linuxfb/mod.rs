//! Interface to the Linux Framebuffer API
//!
//! [`Framebuffer`] memory-maps a single, pre-configured device node and exposes
//! bounds-checked pixel access plus a bulk blit. The pixel encoding is fixed at
//! open time by a [`PixelFormat`] descriptor; a device whose reported layout
//! does not match it is refused.

pub mod fbio;

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::pixels::{Color, Image, PixelFormat, Point, Rect};

pub use self::fbio::{
    set_terminal_mode, ErrnoError, FixScreeninfo, Ioctl, ModeControl, PixelLayout,
    PixelLayoutChannel, TerminalMode, VarScreeninfo,
};

/// Errors returned while opening a `Framebuffer`
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot open framebuffer device {path:?}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported bit depth: {found} bpp (expected {expected})")]
    UnsupportedDepth { found: u32, expected: u32 },
    #[error("unsupported color model: {found:?} (expected {expected:?})")]
    UnsupportedColorModel {
        found: PixelLayout,
        expected: PixelFormat,
    },
    #[error("framebuffer mode control failed: {0}")]
    ModeControl(#[from] ErrnoError),
    #[error("framebuffer memory too small: {len} bytes, need {required}")]
    BufferTooSmall { len: usize, required: usize },
}

/// How [`Framebuffer::open`] negotiates the display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Take the current mode as-is and only check it against the expected format.
    Validate,
    /// Write depth and resolution first, then check what the hardware actually applied.
    Force { width: u32, height: u32 },
}

/// Represents a single, memory-mapped framebuffer device
///
/// ```no_run
/// use canvas_backend_linuxfb::linuxfb::{Framebuffer, OpenMode};
/// use canvas_backend_linuxfb::pixels::{Color, PixelFormat};
///
/// let mut fb = Framebuffer::open("/dev/fb0", PixelFormat::ARGB8888, OpenMode::Validate).unwrap();
/// fb.set(0, 0, Color::rgb(0xff, 0, 0));
/// assert_eq!(fb.at(0, 0), Color::rgb(0xff, 0, 0));
/// fb.close().unwrap();
/// ```
///
/// All access is unsynchronised; the owner is expected to keep the device on a
/// single thread.
pub struct Framebuffer {
    map: MmapMut,
    file: File,
    vinfo: VarScreeninfo,
    finfo: FixScreeninfo,
    format: PixelFormat,
    pitch: usize,
    bounds: Rect,
    /// Panel is mounted rotated by 90°: logical x walks scanlines.
    flipped: bool,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Framebuffer{{{}x{} {}bpp flipped={}}}",
            self.bounds.x1, self.bounds.y1, self.format.bits_per_pixel, self.flipped
        )
    }
}

impl Framebuffer {
    /// Opens the device at `path` using the kernel's `ioctl` interface.
    pub fn open(
        path: impl AsRef<Path>,
        format: PixelFormat,
        mode: OpenMode,
    ) -> Result<Framebuffer, Error> {
        Self::open_with(path, format, mode, &Ioctl)
    }

    /// Opens the device at `path`, negotiating the mode through `control`.
    ///
    /// Fails with:
    /// * `Error::DeviceOpen` if the node cannot be opened or mapped,
    /// * `Error::ModeControl` if any of the control requests fails,
    /// * `Error::UnsupportedDepth` / `Error::UnsupportedColorModel` if the
    ///   resulting mode does not match `format`.
    ///
    /// The file handle is closed again on every failure path.
    pub fn open_with(
        path: impl AsRef<Path>,
        format: PixelFormat,
        mode: OpenMode,
        control: &dyn ModeControl,
    ) -> Result<Framebuffer, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::DeviceOpen { path: path.to_owned(), source })?;

        let mut vinfo = control.get_vscreeninfo(&file)?;
        if let OpenMode::Force { width, height } = mode {
            vinfo.set_bits_per_pixel(format.bits_per_pixel);
            vinfo.set_size_in_pixels(width, height);
            vinfo.set_virtual_size(width, height);
            vinfo.activate_now();
            vinfo = control.put_vscreeninfo(&file, &vinfo)?;
        }

        if vinfo.bits_per_pixel() != format.bits_per_pixel {
            return Err(Error::UnsupportedDepth {
                found: vinfo.bits_per_pixel(),
                expected: format.bits_per_pixel,
            });
        }
        let layout = vinfo.pixel_layout();
        if !format.matches(&layout) {
            return Err(Error::UnsupportedColorModel { found: layout, expected: format });
        }

        let finfo = control.get_fscreeninfo(&file)?;
        let pitch = finfo.line_length();
        let (width, height) = vinfo.virtual_size();
        let required = pitch * height as usize;
        if finfo.memory_len() < required || pitch < width as usize * format.bytes_per_pixel() {
            return Err(Error::BufferTooSmall {
                len: finfo.memory_len(),
                required: required.max(width as usize * format.bytes_per_pixel()),
            });
        }

        let map = unsafe { MmapOptions::new().len(finfo.memory_len()).map_mut(&file) }
            .map_err(|source| Error::DeviceOpen { path: path.to_owned(), source })?;

        let flipped = height > width;
        let bounds = if flipped {
            Rect::from_size(height, width)
        } else {
            Rect::from_size(width, height)
        };

        tracing::info!(
            "framebuffer {:?} ({}): {}x{} {}bpp, pitch {} bytes, {} bytes mapped{}",
            path,
            finfo.id(),
            bounds.x1,
            bounds.y1,
            format.bits_per_pixel,
            pitch,
            map.len(),
            if flipped { ", rotated panel" } else { "" }
        );

        Ok(Framebuffer { map, file, vinfo, finfo, format, pitch, bounds, flipped })
    }

    /// Logical size in pixels, already swapped for a rotated panel.
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn var_screeninfo(&self) -> &VarScreeninfo {
        &self.vinfo
    }

    pub fn fix_screeninfo(&self) -> &FixScreeninfo {
        &self.finfo
    }

    /// The raw mapped pixel memory.
    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    fn offset(&self, x: i32, y: i32) -> Option<usize> {
        if !self.bounds.contains(Point::new(x, y)) {
            return None;
        }
        let (row, col) = if self.flipped {
            (x as usize, (self.bounds.y1 - 1 - y) as usize)
        } else {
            (y as usize, x as usize)
        };
        let bpp = self.format.bytes_per_pixel();
        let i = row * self.pitch + col * bpp;
        (i + bpp <= self.map.len()).then_some(i)
    }

    /// Reads the pixel at `(x, y)`. Out-of-bounds reads return a fully transparent color.
    pub fn at(&self, x: i32, y: i32) -> Color {
        match self.offset(x, y) {
            Some(i) => self.format.read(&self.map[i..]),
            None => Color::TRANSPARENT,
        }
    }

    /// Writes the pixel at `(x, y)`.
    ///
    /// Out-of-bounds writes are dropped. A color with zero alpha leaves the
    /// existing pixel untouched.
    pub fn set(&mut self, x: i32, y: i32, color: Color) {
        if color.is_transparent() {
            return;
        }
        if let Some(i) = self.offset(x, y) {
            self.format.write(&mut self.map[i..], color);
        }
    }

    /// Copies `src`, starting at `sp`, into the device rectangle `r`.
    ///
    /// A full-frame, zero-origin blit of an image in the device's own format
    /// is copied scanline by scanline. Everything else goes through [`Framebuffer::set`].
    pub fn draw(&mut self, r: Rect, src: &Image, sp: Point) -> Result<(), Error> {
        if !self.flipped
            && r == self.bounds
            && src.bounds() == self.bounds
            && sp == Point::ZERO
            && src.format() == self.format
        {
            let stride = src.stride();
            for y in 0..src.height() {
                let start = y as usize * self.pitch;
                self.map[start..start + stride].copy_from_slice(src.row(y));
            }
            return Ok(());
        }
        self.composite(r, src, sp);
        Ok(())
    }

    /// Per-pixel copy, honoring the clip rectangle and source offset.
    pub(crate) fn composite(&mut self, r: Rect, src: &Image, sp: Point) {
        let clip = r.intersect(&self.bounds);
        for y in clip.y0..clip.y1 {
            for x in clip.x0..clip.x1 {
                let c = src.pixel(sp.x + (x - r.x0), sp.y + (y - r.y0));
                self.set(x, y, c);
            }
        }
    }

    /// Unmaps the memory and closes the device file.
    pub fn close(self) -> Result<(), Error> {
        tracing::debug!("closing framebuffer {:?}", self);
        let Framebuffer { map, file, .. } = self;
        map.flush()?;
        drop(map);
        drop(file);
        Ok(())
    }
}
