//! Shared UI icons.
//!
//! `console::Emoji` falls back to the ASCII form on terminals without
//! emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");

// Gear changes
pub static DOWNSHIFT: Emoji<'_, '_> = Emoji("🔻 ", "[DOWN]");
pub static UPSHIFT: Emoji<'_, '_> = Emoji("🔺 ", "[UP]");
pub static STALL: Emoji<'_, '_> = Emoji("🐌 ", "[STALL]");

// Recovery
pub static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[CLEAN]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[WAIT]");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "[GEAR]");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "[PKG]");
