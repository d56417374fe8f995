use super::method::CaptureMethod;
use super::target::CaptureTarget;
use super::{CaptureError, CaptureResult};
use image::RgbImage;

/// Child window class most emulators render into.
pub const RENDER_CHILD_CLASS: &str = "RenderWindow";

/// Pixel access to one already-resolved window.
pub trait WindowCapture: Send {
    /// Whether the handle still refers to a live window.
    fn is_alive(&self) -> bool;

    /// One grab. `None` when the window is zero-sized or the copy failed.
    fn grab(&mut self, method: CaptureMethod) -> Option<RgbImage>;
}

/// Find a top-level window by title and/or class, preferring its render child.
pub fn resolve_window(title: Option<&str>, class: Option<&str>) -> CaptureResult<CaptureTarget> {
    #[cfg(windows)]
    {
        win32::resolve(title, class)
    }
    #[cfg(not(windows))]
    {
        let _ = (title, class);
        Err(CaptureError::Unsupported {
            what: "window capture".to_string(),
        })
    }
}

/// Open a capture backend for a resolved window target.
pub fn open_window(target: &CaptureTarget) -> CaptureResult<Box<dyn WindowCapture>> {
    let handle = target.capture_handle().ok_or_else(|| CaptureError::NotAWindow {
        target: target.to_string(),
    })?;
    #[cfg(windows)]
    {
        Ok(Box::new(win32::Win32Window::new(handle)))
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Err(CaptureError::Unsupported {
            what: "window capture".to_string(),
        })
    }
}

#[cfg(windows)]
mod win32 {
    use super::super::method::CaptureMethod;
    use super::super::target::{CaptureTarget, WindowHandle};
    use super::super::{CaptureError, CaptureResult};
    use super::{RENDER_CHILD_CLASS, WindowCapture};
    use image::RgbImage;
    use std::ffi::c_void;
    use windows::Win32::Foundation::{HWND, RECT};
    use windows::Win32::Graphics::Gdi::{
        BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CreateCompatibleBitmap, CreateCompatibleDC,
        DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDC, GetDIBits, ReleaseDC, SRCCOPY, SelectObject,
    };
    use windows::Win32::Storage::Xps::{PRINT_WINDOW_FLAGS, PrintWindow};
    use windows::Win32::UI::WindowsAndMessaging::{
        FindWindowExW, FindWindowW, GetClientRect, IsWindow,
    };
    use windows::core::PCWSTR;

    // PW_RENDERFULLCONTENT
    const PRINT_FULL_CONTENT: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(2);

    fn wide(text: &str) -> Vec<u16> {
        text.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn hwnd(handle: WindowHandle) -> HWND {
        HWND(handle.0 as *mut c_void)
    }

    pub fn resolve(title: Option<&str>, class: Option<&str>) -> CaptureResult<CaptureTarget> {
        let title_w = title.map(wide);
        let class_w = class.map(wide);
        let as_pcwstr =
            |w: &Option<Vec<u16>>| w.as_ref().map_or(PCWSTR::null(), |w| PCWSTR(w.as_ptr()));
        let not_found = || CaptureError::WindowNotFound {
            title: title.map(str::to_string),
            class: class.map(str::to_string),
        };

        let main = unsafe { FindWindowW(as_pcwstr(&class_w), as_pcwstr(&title_w)) }
            .ok()
            .filter(|h| !h.0.is_null())
            .ok_or_else(not_found)?;
        let child_class = wide(RENDER_CHILD_CLASS);
        let child = unsafe {
            FindWindowExW(main, HWND::default(), PCWSTR(child_class.as_ptr()), PCWSTR::null())
        }
        .ok()
        .filter(|h| !h.0.is_null());

        Ok(CaptureTarget::Window {
            handle: WindowHandle(main.0 as isize),
            child: child.map(|h| WindowHandle(h.0 as isize)),
            title: title.map(str::to_string),
        })
    }

    pub struct Win32Window {
        handle: WindowHandle,
    }

    impl Win32Window {
        pub fn new(handle: WindowHandle) -> Self {
            Self { handle }
        }

        fn client_size(&self) -> Option<(i32, i32)> {
            let mut rect = RECT::default();
            unsafe { GetClientRect(hwnd(self.handle), &mut rect) }.ok()?;
            let (w, h) = (rect.right - rect.left, rect.bottom - rect.top);
            (w > 0 && h > 0).then_some((w, h))
        }
    }

    impl WindowCapture for Win32Window {
        fn is_alive(&self) -> bool {
            unsafe { IsWindow(hwnd(self.handle)) }.as_bool()
        }

        fn grab(&mut self, method: CaptureMethod) -> Option<RgbImage> {
            let (width, height) = self.client_size()?;
            let window = hwnd(self.handle);
            unsafe {
                let window_dc = GetDC(window);
                if window_dc.is_invalid() {
                    return None;
                }
                let mem_dc = CreateCompatibleDC(window_dc);
                let bitmap = CreateCompatibleBitmap(window_dc, width, height);
                let previous = SelectObject(mem_dc, bitmap);

                let copied = match method {
                    CaptureMethod::FastCopy => {
                        BitBlt(mem_dc, 0, 0, width, height, window_dc, 0, 0, SRCCOPY).is_ok()
                    }
                    CaptureMethod::CompatibilityRender => {
                        PrintWindow(window, mem_dc, PRINT_FULL_CONTENT).as_bool()
                    }
                };

                let mut bgra = vec![0u8; (width as usize) * (height as usize) * 4];
                let mut info = BITMAPINFO {
                    bmiHeader: BITMAPINFOHEADER {
                        biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                        biWidth: width,
                        // Negative height: rows top-down
                        biHeight: -height,
                        biPlanes: 1,
                        biBitCount: 32,
                        biCompression: BI_RGB.0,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let lines = if copied {
                    SelectObject(mem_dc, previous);
                    GetDIBits(
                        mem_dc,
                        bitmap,
                        0,
                        height as u32,
                        Some(bgra.as_mut_ptr() as *mut c_void),
                        &mut info,
                        DIB_RGB_COLORS,
                    )
                } else {
                    SelectObject(mem_dc, previous);
                    0
                };

                let _ = DeleteObject(bitmap);
                let _ = DeleteDC(mem_dc);
                ReleaseDC(window, window_dc);

                if lines != height {
                    return None;
                }
                let rgb: Vec<u8> = bgra.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0]]).collect();
                RgbImage::from_raw(width as u32, height as u32, rgb)
            }
        }
    }
}
