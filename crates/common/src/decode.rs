//! Boundary with the source-model decoder.
//!
//! Parsing the source format is somebody else's job; the pipeline only needs
//! a sequence of elements. [`JsonLinesDecoder`] reads the neutral dump format
//! (one JSON [`Element`] per line) that exporters and tests produce.

use crate::element::{DecodeError, Element};

/// Produces the element stream of one model. Element order carries no meaning.
pub trait ModelDecoder {
    fn decode<'a>(
        &'a self,
        raw: &'a [u8],
    ) -> Box<dyn Iterator<Item = Result<Element, DecodeError>> + 'a>;
}

/// Decoder for newline-delimited JSON element dumps. Blank lines are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesDecoder;

impl ModelDecoder for JsonLinesDecoder {
    fn decode<'a>(
        &'a self,
        raw: &'a [u8],
    ) -> Box<dyn Iterator<Item = Result<Element, DecodeError>> + 'a> {
        let iter = raw
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
            .map(|(i, line)| {
                let element: Element = serde_json::from_slice(line)
                    .map_err(|source| DecodeError::Json { line: i + 1, source })?;
                element.validate()?;
                Ok(element)
            });
        Box::new(iter)
    }
}

/// Count the non-blank lines of a dump, used as the progress denominator.
pub fn count_json_lines(raw: &[u8]) -> usize {
    raw.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count()
}
