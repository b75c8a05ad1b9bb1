//! SUPPORTED: the server's answer to OPTIONS.

use std::collections::HashMap;

use crate::frame::frame_errors::ParseError;
use crate::frame::types;

#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_multimap(buf)?;
        Ok(Supported { options })
    }

    /// Compression algorithms the server advertises under `COMPRESSION`.
    pub fn compression_algorithms(&self) -> &[String] {
        self.options
            .get("COMPRESSION")
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
