//! Color utility for the CLI's error output.
//!
//! Because the binary has no public API the module is `pub(crate)` by default.
/// Decide at runtime whether color escapes should be emitted. Honors the
/// de-facto standard `NO_COLOR` environment variable so users can globally
/// disable ANSI sequences.
pub(crate) fn colors_enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none()
}
