/// Compile-time knobs recognized by the compiler.
///
/// None of these affect the emitted bytecode; they only change which warnings
/// are reported and how diagnostics are rendered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    /// Master switch for all non-fatal parser warnings.
    pub warnings: bool,
    /// Warn when a local shadows a still-visible local of the same name.
    pub warn_shadowing: bool,
    /// Wrap diagnostics in ANSI colors.
    pub color: bool,
    /// Render diagnostics as a single line, without the source excerpt.
    pub short_errors: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            warnings: true,
            warn_shadowing: true,
            color: false,
            short_errors: false,
        }
    }
}

impl CompileOptions {
    pub fn with_warnings(mut self, on: bool) -> Self {
        self.warnings = on;
        self
    }

    pub fn with_shadow_warnings(mut self, on: bool) -> Self {
        self.warn_shadowing = on;
        self
    }

    pub fn with_color(mut self, on: bool) -> Self {
        self.color = on;
        self
    }

    pub fn with_short_errors(mut self, on: bool) -> Self {
        self.short_errors = on;
        self
    }

    /// Whether shadowing warnings should be reported at all.
    pub(crate) fn shadowing_enabled(&self) -> bool {
        self.warnings && self.warn_shadowing
    }
}
