use std::io::{Error, Write};

use crate::layout::Layout;
use crate::record::Record;

/// The default human-readable line format.
///
/// Renders `time | LEVEL | module:line - message`, followed by the record's
/// key/value context pairs when present.
pub struct LineLayout;

impl Layout for LineLayout {
    fn format(&self, rec: &Record, wr: &mut dyn Write) -> Result<(), Error> {
        write!(
            wr,
            "{} | {:<8} | {}:{} - {}",
            rec.time().format("%Y-%m-%d %H:%M:%S%.3f"),
            rec.level().name(),
            rec.module(),
            rec.line(),
            rec.message()
        )?;

        for (key, value) in rec.context() {
            write!(wr, " {}={}", key, value)?;
        }

        wr.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;

    #[test]
    fn renders_metadata_and_context() {
        let rec = Record::builder(Level::WARNING, "client stopped connection")
            .module("proxy::stream")
            .line(10053)
            .context("host", "::1")
            .context("port", 10053)
            .build();
        let mut buf = Vec::new();

        LineLayout.format(&rec, &mut buf).unwrap();
        let line = String::from_utf8(buf).unwrap();

        assert!(line.contains("| WARNING  |"));
        assert!(line.contains("proxy::stream:10053 - client stopped connection"));
        assert!(line.contains(" host=\"::1\" port=10053"));
        assert!(line.ends_with('\n'));
    }
}
