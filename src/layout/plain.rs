use std::io::{Error, Write};

use crate::layout::Layout;
use crate::record::Record;

/// Writes the record message and nothing else, one message per line.
pub struct PlainLayout;

impl Layout for PlainLayout {
    fn format(&self, rec: &Record, wr: &mut dyn Write) -> Result<(), Error> {
        wr.write_all(rec.message().as_bytes())?;
        wr.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;

    #[test]
    fn message_with_terminator() {
        let rec = Record::builder(Level::INFO, "GET /static/image.png 404").build();
        let mut buf = Vec::new();

        PlainLayout.format(&rec, &mut buf).unwrap();

        assert_eq!(b"GET /static/image.png 404\n".to_vec(), buf);
    }
}
