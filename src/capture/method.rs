use std::fmt;

/// How pixels are pulled out of a window. Fixed for the lifetime of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMethod {
    /// Copy straight from the window surface. Cheapest; returns nothing for
    /// occluded or minimized windows on some systems.
    FastCopy,
    /// Ask the window to render into an offscreen buffer. Slower, but works with
    /// emulators whose virtualized surface cannot be copied directly.
    CompatibilityRender,
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptureMethod::FastCopy => "fast-copy",
            CaptureMethod::CompatibilityRender => "compatibility-render",
        })
    }
}

/// Title → method selection, injected where a capture manager is built.
pub type MethodPolicy = dyn Fn(Option<&str>) -> CaptureMethod + Send + Sync;

/// Substring rules checked in order; the first hit wins, otherwise `fallback`.
#[derive(Debug, Clone)]
pub struct TitleRules {
    rules: Vec<(String, CaptureMethod)>,
    fallback: CaptureMethod,
}

impl TitleRules {
    pub fn new(fallback: CaptureMethod) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    pub fn with_rule(mut self, title_fragment: impl Into<String>, method: CaptureMethod) -> Self {
        self.rules.push((title_fragment.into(), method));
        self
    }

    /// Emulators known to need offscreen rendering.
    pub fn known_emulators() -> Self {
        Self::new(CaptureMethod::FastCopy)
            .with_rule("雷电模拟器", CaptureMethod::CompatibilityRender)
    }

    pub fn fallback(&self) -> CaptureMethod {
        self.fallback
    }

    pub fn select(&self, title: Option<&str>) -> CaptureMethod {
        let Some(title) = title else {
            return self.fallback;
        };
        self.rules
            .iter()
            .find(|(fragment, _)| title.contains(fragment.as_str()))
            .map_or(self.fallback, |(_, method)| *method)
    }
}

/// The built-in policy.
pub fn default_policy(title: Option<&str>) -> CaptureMethod {
    TitleRules::known_emulators().select(title)
}
