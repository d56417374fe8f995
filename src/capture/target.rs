use std::fmt;

/// Raw window handle. Kept as an integer so it can cross thread boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What to capture. A window target is resolved once at startup and never
/// re-resolved; if the handle dies the capture loop stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Device {
        serial: String,
    },
    Window {
        handle: WindowHandle,
        /// The emulator's render surface, when it draws into a child window
        child: Option<WindowHandle>,
        title: Option<String>,
    },
}

impl CaptureTarget {
    /// The handle pixels are read from.
    pub fn capture_handle(&self) -> Option<WindowHandle> {
        match self {
            CaptureTarget::Device { .. } => None,
            CaptureTarget::Window { handle, child, .. } => Some(child.unwrap_or(*handle)),
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            CaptureTarget::Device { .. } => None,
            CaptureTarget::Window { title, .. } => title.as_deref(),
        }
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Device { serial } => write!(f, "device {serial}"),
            CaptureTarget::Window {
                handle,
                child,
                title,
            } => {
                write!(f, "window {handle}")?;
                if let Some(child) = child {
                    write!(f, " (render child {child})")?;
                }
                if let Some(title) = title {
                    write!(f, " '{title}'")?;
                }
                Ok(())
            }
        }
    }
}
