// https://www.rfc-editor.org/rfc/rfc3501#section-7.4.2
//
// BODYSTRUCTURE arrives as one parenthesised tree inside a FETCH response; the grammar lives with
// the rest of the response parser and this module is its standalone face: parse a captured
// structure into the MIME tree the store hands to callers.

use super::parser::parser as grammar;
use crate::{codec, email};
use anyhow::Context as _;

pub fn parse(input: &[u8]) -> anyhow::Result<email::Body> {
  grammar::body(input)
    .map_err(|_| anyhow::Error::new(crate::Error::ProtocolError))
    .with_context(|| codec::summarize(input))
}
