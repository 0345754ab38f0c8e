use bytes::BufMut;

fn encode_length(buf: &mut impl BufMut, len: usize) {
    if len > 127 {
        buf.put_u32(len as u32 | 0x8000_0000u32);
    } else {
        buf.put_u8(len as u8);
    }
}

/// Write name-value pair
pub fn encode_name_value_pair(buf: &mut impl BufMut, name: &[u8], value: &[u8]) {
    encode_length(buf, name.len());
    encode_length(buf, value.len());
    buf.put_slice(name);
    buf.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn long_value_uses_four_byte_length() {
        let mut buf = BytesMut::new();
        let value = vec![b'x'; 200];
        encode_name_value_pair(&mut buf, b"NAME", &value);
        assert_eq!(&buf[..5], &[4u8, 0x80, 0, 0, 200]);
        assert_eq!(buf.len(), 5 + 4 + 200);
    }
}
