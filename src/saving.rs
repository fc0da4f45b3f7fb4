use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{BufReader, Cursor, Write};

use crate::error::Result;
use crate::subset::Mask;

/// Encode a subset mask as a gzip-compressed bincode blob for the `subsets`
/// table.
pub fn encode_mask(mask: &Mask) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serialize_into(&mut encoder, mask)?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

pub fn decode_mask(blob: &[u8]) -> Result<Mask> {
    let decoder = GzDecoder::new(Cursor::new(blob));
    let mut reader = BufReader::new(decoder);
    let mask: Mask = deserialize_from(&mut reader)?;
    Ok(mask)
}
