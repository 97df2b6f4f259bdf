use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A severity level with its display metadata.
///
/// Levels are totally ordered by their numeric severity `no`; the name, color
/// markup and icon are carried along for layouts and never take part in
/// comparisons. Records reference a level, destinations keep only the numeric
/// threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    name: Cow<'static, str>,
    no: i32,
    color: Cow<'static, str>,
    icon: Cow<'static, str>,
}

impl Level {
    pub const TRACE: Level = Level::predefined("TRACE", 5, "<cyan><bold>", "✏️");
    pub const DEBUG: Level = Level::predefined("DEBUG", 10, "<blue><bold>", "🐞");
    pub const INFO: Level = Level::predefined("INFO", 20, "<bold>", "ℹ️");
    pub const SUCCESS: Level = Level::predefined("SUCCESS", 25, "<green><bold>", "✔️");
    pub const WARNING: Level = Level::predefined("WARNING", 30, "<yellow><bold>", "⚠️");
    pub const ERROR: Level = Level::predefined("ERROR", 40, "<red><bold>", "❌");
    pub const CRITICAL: Level = Level::predefined("CRITICAL", 50, "<RED><bold>", "☠️");

    const fn predefined(
        name: &'static str,
        no: i32,
        color: &'static str,
        icon: &'static str,
    ) -> Level {
        Level {
            name: Cow::Borrowed(name),
            no,
            color: Cow::Borrowed(color),
            icon: Cow::Borrowed(icon),
        }
    }

    /// Constructs a custom level.
    ///
    /// Custom levels interoperate with the built-in ones through their
    /// numeric severity, e.g. a level with `no = 15` sits between DEBUG
    /// and INFO.
    pub fn new<N, C, I>(name: N, no: i32, color: C, icon: I) -> Level
    where
        N: Into<Cow<'static, str>>,
        C: Into<Cow<'static, str>>,
        I: Into<Cow<'static, str>>,
    {
        Level {
            name: name.into(),
            no,
            color: color.into(),
            icon: icon.into(),
        }
    }

    /// Returns an integer severity representation.
    pub fn no(&self) -> i32 {
        self.no
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Color markup consumed by an external colorizer, e.g. `<red><bold>`.
    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }
}

impl fmt::Display for Level {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.name)
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Level {
        match level {
            log::Level::Error => Level::ERROR,
            log::Level::Warn => Level::WARNING,
            log::Level::Info => Level::INFO,
            log::Level::Debug => Level::DEBUG,
            log::Level::Trace => Level::TRACE,
        }
    }
}
