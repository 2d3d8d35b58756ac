//! This module wraps the framebuffer API's `ioctl` calls.
//! It uses a generated binding, based on the `<linux/fb.h>` and `<linux/kd.h>` headers.
//!
//! The structures are passed to the kernel by pointer; the size checks below
//! catch a header that does not match the ABI this module was written against.

#![allow(non_camel_case_types, non_upper_case_globals, dead_code)]
include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

use std::fs::File;
use std::os::unix::io::AsRawFd;

const _: () = assert!(std::mem::size_of::<fb_var_screeninfo>() == 160);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(std::mem::size_of::<fb_fix_screeninfo>() == 80);
#[cfg(target_pointer_width = "32")]
const _: () = assert!(std::mem::size_of::<fb_fix_screeninfo>() == 68);

/// Represents an error read from the libc global `errno`
///
/// These errors are returned, when `ioctl` or other wrapped
/// libc calls fail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("FBIoError {errno}: {message}")]
pub struct ErrnoError {
    /// Error number. Compare this with the `libc::E*` constants,
    /// to handle specific errors.
    pub errno: i32,
    /// Message produced by `strerror(errno)`. This value varies
    /// based on the user's locale, so do not use it for comparisons.
    pub message: String,
}

impl ErrnoError {
    /// Captures the calling thread's current `errno`.
    pub fn last() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn from_errno(errno: i32) -> Self {
        let message = std::io::Error::from_raw_os_error(errno).to_string();
        Self { errno, message }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PixelLayoutChannel {
    /// Start of data, in bits
    pub offset: u32,
    /// Size of data, in bits
    pub length: u32,
    /// When true, the most significant bit is on the right.
    pub msb_right: bool,
}

impl From<fb_bitfield> for PixelLayoutChannel {
    fn from(bitfield: fb_bitfield) -> Self {
        Self {
            offset: bitfield.offset,
            length: bitfield.length,
            msb_right: bitfield.msb_right != 0,
        }
    }
}

impl From<PixelLayoutChannel> for fb_bitfield {
    fn from(channel: PixelLayoutChannel) -> Self {
        Self {
            offset: channel.offset,
            length: channel.length,
            msb_right: channel.msb_right as u32,
        }
    }
}

/// Channel layout as reported by the driver.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PixelLayout {
    pub red: PixelLayoutChannel,
    pub green: PixelLayoutChannel,
    pub blue: PixelLayoutChannel,
    pub alpha: PixelLayoutChannel,
}

/// Variable screen information: resolution, depth and channel layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VarScreeninfo {
    pub internal: fb_var_screeninfo,
}

impl VarScreeninfo {
    pub fn size_in_pixels(&self) -> (u32, u32) {
        (self.internal.xres, self.internal.yres)
    }

    pub fn set_size_in_pixels(&mut self, width: u32, height: u32) {
        self.internal.xres = width;
        self.internal.yres = height;
    }

    pub fn virtual_size(&self) -> (u32, u32) {
        (self.internal.xres_virtual, self.internal.yres_virtual)
    }

    pub fn set_virtual_size(&mut self, width: u32, height: u32) {
        self.internal.xres_virtual = width;
        self.internal.yres_virtual = height;
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.internal.bits_per_pixel
    }

    pub fn set_bits_per_pixel(&mut self, value: u32) {
        self.internal.bits_per_pixel = value;
    }

    pub fn pixel_layout(&self) -> PixelLayout {
        PixelLayout {
            red: PixelLayoutChannel::from(self.internal.red),
            green: PixelLayoutChannel::from(self.internal.green),
            blue: PixelLayoutChannel::from(self.internal.blue),
            alpha: PixelLayoutChannel::from(self.internal.transp),
        }
    }

    pub fn set_pixel_layout(&mut self, layout: PixelLayout) {
        self.internal.red = layout.red.into();
        self.internal.green = layout.green.into();
        self.internal.blue = layout.blue.into();
        self.internal.transp = layout.alpha.into();
    }

    pub fn activate_now(&mut self) {
        self.internal.activate = FB_ACTIVATE_NOW;
    }
}

/// Fixed screen information: memory length and scanline pitch.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixScreeninfo {
    pub internal: fb_fix_screeninfo,
}

impl FixScreeninfo {
    pub fn id(&self) -> String {
        let bytes: Vec<u8> = self
            .internal
            .id
            .iter()
            .map(|&c| c as u8)
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Total length of the mappable framebuffer memory, in bytes.
    pub fn memory_len(&self) -> usize {
        self.internal.smem_len as usize
    }

    /// Length of one scanline, in bytes.
    pub fn line_length(&self) -> usize {
        self.internal.line_length as usize
    }
}

/// The three mode-info control requests a framebuffer device answers.
///
/// [`Ioctl`] issues them against the kernel. The trait exists so the
/// device core can be driven by anything that speaks the same protocol.
pub trait ModeControl: Send + Sync {
    fn get_vscreeninfo(&self, file: &File) -> Result<VarScreeninfo, ErrnoError>;

    /// Writes `request`, then re-reads the configuration the hardware
    /// actually applied. Callers must validate the returned value, not the request.
    fn put_vscreeninfo(&self, file: &File, request: &VarScreeninfo)
        -> Result<VarScreeninfo, ErrnoError>;

    fn get_fscreeninfo(&self, file: &File) -> Result<FixScreeninfo, ErrnoError>;
}

/// Real `ioctl(2)` requests against an open device node.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ioctl;

impl ModeControl for Ioctl {
    fn get_vscreeninfo(&self, file: &File) -> Result<VarScreeninfo, ErrnoError> {
        get_vscreeninfo(file)
    }

    fn put_vscreeninfo(
        &self,
        file: &File,
        request: &VarScreeninfo,
    ) -> Result<VarScreeninfo, ErrnoError> {
        put_vscreeninfo(file, request)?;
        get_vscreeninfo(file)
    }

    fn get_fscreeninfo(&self, file: &File) -> Result<FixScreeninfo, ErrnoError> {
        get_fscreeninfo(file)
    }
}

/// Wrapper around `ioctl(fd, FBIOGET_VSCREENINFO, ...)`.
pub fn get_vscreeninfo(file: &impl AsRawFd) -> Result<VarScreeninfo, ErrnoError> {
    let mut vinfo: fb_var_screeninfo = bytemuck::Zeroable::zeroed();
    match unsafe { libc::ioctl(file.as_raw_fd(), FBIOGET_VSCREENINFO as _, &mut vinfo) } {
        -1 => Err(ErrnoError::last()),
        _ => Ok(VarScreeninfo { internal: vinfo }),
    }
}

/// Wrapper around `ioctl(fd, FBIOPUT_VSCREENINFO, ...)`.
pub fn put_vscreeninfo(
    file: &impl AsRawFd,
    var_screeninfo: &VarScreeninfo,
) -> Result<(), ErrnoError> {
    let mut vinfo = var_screeninfo.internal;
    match unsafe { libc::ioctl(file.as_raw_fd(), FBIOPUT_VSCREENINFO as _, &mut vinfo) } {
        -1 => Err(ErrnoError::last()),
        _ => Ok(()),
    }
}

/// Wrapper around `ioctl(fd, FBIOGET_FSCREENINFO, ...)`.
pub fn get_fscreeninfo(file: &impl AsRawFd) -> Result<FixScreeninfo, ErrnoError> {
    let mut finfo = fb_fix_screeninfo::default();
    match unsafe { libc::ioctl(file.as_raw_fd(), FBIOGET_FSCREENINFO as _, &mut finfo) } {
        -1 => Err(ErrnoError::last()),
        _ => Ok(FixScreeninfo { internal: finfo }),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TerminalMode {
    Text,
    Graphics,
}

impl TerminalMode {
    fn to_ulong(self) -> libc::c_ulong {
        match self {
            TerminalMode::Text => KD_TEXT,
            TerminalMode::Graphics => KD_GRAPHICS,
        }
        .into()
    }
}

/// Switch the terminal into desired mode.
///
/// In text mode, console output is drawn to the terminal by the fbcon driver.
/// In graphics mode it is not, so the cursor stops blinking over our pixels.
///
/// When switching to graphics mode, make sure to switch back to text mode whenever
/// the application exits. Otherwise the terminal will appear to be "stuck".
pub fn set_terminal_mode(tty: &impl AsRawFd, mode: TerminalMode) -> Result<(), ErrnoError> {
    match unsafe { libc::ioctl(tty.as_raw_fd(), KDSETMODE as _, mode.to_ulong()) } {
        -1 => Err(ErrnoError::last()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_screeninfo_field_offsets_match_kernel_abi() {
        let mut vinfo: fb_var_screeninfo = bytemuck::Zeroable::zeroed();
        vinfo.bits_per_pixel = 16;
        vinfo.red.offset = 11;
        vinfo.reserved[3] = 0xdead;

        let bytes = bytemuck::bytes_of(&vinfo);
        assert_eq!(&bytes[24..28], &16u32.to_ne_bytes());
        assert_eq!(&bytes[32..36], &11u32.to_ne_bytes());
        assert_eq!(&bytes[156..160], &0xdeadu32.to_ne_bytes());
    }

    #[test]
    fn fix_screeninfo_field_offsets_match_kernel_abi() {
        let finfo = fb_fix_screeninfo::default();
        let base = &finfo as *const _ as usize;
        let offset = |field: *const u8| field as usize - base;
        assert_eq!(offset(std::ptr::addr_of!(finfo.id).cast()), 0);
        assert_eq!(offset(std::ptr::addr_of!(finfo.smem_start).cast()), 16);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(offset(std::ptr::addr_of!(finfo.smem_len).cast()), 24);
            assert_eq!(offset(std::ptr::addr_of!(finfo.line_length).cast()), 48);
        }
    }

    #[test]
    fn fix_screeninfo_id_stops_at_nul() {
        let mut finfo = FixScreeninfo::default();
        for (dst, &src) in finfo.internal.id.iter_mut().zip(b"simplefb") {
            *dst = src as _;
        }
        finfo.internal.id[6] = 0;
        assert_eq!(finfo.id(), "simple");
    }

    #[test]
    fn ioctl_on_regular_file_reports_errno() {
        let file = File::open("/proc/self/stat").unwrap();
        let err = Ioctl.get_vscreeninfo(&file).unwrap_err();
        assert_eq!(err.errno, libc::ENOTTY);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn layout_round_trips_through_bitfields() {
        let mut vinfo = VarScreeninfo::default();
        let layout = PixelLayout {
            red: PixelLayoutChannel { offset: 11, length: 5, msb_right: false },
            green: PixelLayoutChannel { offset: 5, length: 6, msb_right: false },
            blue: PixelLayoutChannel { offset: 0, length: 5, msb_right: true },
            alpha: PixelLayoutChannel { offset: 0, length: 0, msb_right: false },
        };
        vinfo.set_pixel_layout(layout);
        assert_eq!(vinfo.pixel_layout(), layout);
        assert_eq!(vinfo.internal.blue.msb_right, 1);
    }
}
