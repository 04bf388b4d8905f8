//! Bounds-checked big-endian reader over a byte slice

use super::DecodeError;

/// Forward-only reader; every read checks the remaining length first.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_be_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }

    /// Read up to (not including) `delim` and step over it.
    pub fn read_until(&mut self, delim: u8) -> Result<&'a [u8], DecodeError> {
        let rest = &self.buf[self.pos..];
        let Some(len) = rest.iter().position(|&b| b == delim) else {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: rest.len() + 1,
                available: rest.len(),
            });
        };
        let out = &rest[..len];
        self.pos += len + 1;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_and_advances() {
        let bytes = [0x01, 0xff, 0xfe, 0x00, 0x00, 0x01, 0x2c, 0x7f];
        let mut cursor = ByteCursor::new(&bytes);
        assert_eq!(cursor.read_u8().unwrap(), 1);
        assert_eq!(cursor.read_i16().unwrap(), -2);
        assert_eq!(cursor.read_u32().unwrap(), 300);
        assert_eq!(cursor.read_i8().unwrap(), 127);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn out_of_range_read_is_an_error_not_a_panic() {
        let mut cursor = ByteCursor::new(&[0, 1, 2]);
        cursor.read_u8().unwrap();
        let err = cursor.read_i64().unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 1,
                needed: 8,
                available: 2
            }
        );
        // position unchanged after a failed read
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn read_until_consumes_delimiter() {
        let mut cursor = ByteCursor::new(b"1,4711,rest");
        assert_eq!(cursor.read_until(b',').unwrap(), b"1");
        assert_eq!(cursor.read_until(b',').unwrap(), b"4711");
        assert_eq!(cursor.read_bytes(4).unwrap(), b"rest");
        assert!(cursor.read_until(b',').is_err());
    }
}
