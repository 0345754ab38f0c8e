use bytes::{Buf, Bytes};

use super::records::RecordError;

fn decode_length(block: &mut Bytes) -> Result<usize, RecordError> {
    match block.first().copied() {
        None => Err(RecordError::Truncated("name-value length")),
        Some(b) if b & 0x80 == 0 => Ok(block.get_u8().into()),
        Some(_) => {
            if block.len() < 4 {
                return Err(RecordError::Truncated("name-value length"));
            }
            Ok((block.get_u32() & 0x7fff_ffff) as usize)
        }
    }
}

/// Read name-value pair
/// Returns (name,value,remaining)
pub fn decode_name_value_pair(mut block: Bytes) -> Result<(Bytes, Bytes, Bytes), RecordError> {
    let name_length = decode_length(&mut block)?;
    let value_length = decode_length(&mut block)?;
    if block.len() < name_length + value_length {
        return Err(RecordError::Truncated("name-value data"));
    }
    let name = block.split_to(name_length);
    let value = block.split_to(value_length);
    Ok((name, value, block))
}

/// Decode every pair in a PARAMS or GET_VALUES block.
pub fn decode_name_value_pairs(mut block: Bytes) -> Result<Vec<(Bytes, Bytes)>, RecordError> {
    let mut pairs = Vec::new();
    while !block.is_empty() {
        let (name, value, rest) = decode_name_value_pair(block)?;
        pairs.push((name, value));
        block = rest;
    }
    Ok(pairs)
}
