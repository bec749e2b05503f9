use crate::tuple::point::{Point, Rect};

const U8_SIZE: usize = std::mem::size_of::<u8>();
const U16_SIZE: usize = std::mem::size_of::<u16>();
const U32_SIZE: usize = std::mem::size_of::<u32>();
const U64_SIZE: usize = std::mem::size_of::<u64>();
const F64_SIZE: usize = std::mem::size_of::<f64>();

/// Writes big-endian primitives into a byte buffer, front to back.
pub(crate) struct Serializer<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl<'a> Serializer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    pub fn serialize_u8(&mut self, val: u8) {
        self.buffer[self.pos..self.pos + U8_SIZE].copy_from_slice(val.to_be_bytes().as_slice());
        self.pos += U8_SIZE;
    }

    pub fn serialize_u16(&mut self, val: u16) {
        self.buffer[self.pos..self.pos + U16_SIZE].copy_from_slice(val.to_be_bytes().as_slice());
        self.pos += U16_SIZE;
    }

    pub fn serialize_u32(&mut self, val: u32) {
        self.buffer[self.pos..self.pos + U32_SIZE].copy_from_slice(val.to_be_bytes().as_slice());
        self.pos += U32_SIZE;
    }

    pub fn serialize_u64(&mut self, val: u64) {
        self.buffer[self.pos..self.pos + U64_SIZE].copy_from_slice(val.to_be_bytes().as_slice());
        self.pos += U64_SIZE;
    }

    pub fn serialize_f64(&mut self, val: f64) {
        self.buffer[self.pos..self.pos + F64_SIZE].copy_from_slice(val.to_be_bytes().as_slice());
        self.pos += F64_SIZE;
    }

    pub fn serialize_point(&mut self, point: &Point) {
        self.serialize_f64(point.x);
        self.serialize_f64(point.y);
    }

    pub fn serialize_rect(&mut self, rect: &Rect) {
        self.serialize_point(&rect.min);
        self.serialize_point(&rect.max);
    }

    /// Writes a string prefixed by its u16 length.
    pub fn serialize_str(&mut self, val: &str) {
        self.serialize_u16(val.len() as u16);
        self.copy_bytes(val.as_bytes());
    }

    pub fn copy_bytes(&mut self, bytes: &[u8]) {
        self.buffer[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Hands out the next `len` bytes for a caller that encodes them itself.
    pub fn reserve(&mut self, len: usize) -> &mut [u8] {
        let start = self.pos;
        self.pos += len;
        &mut self.buffer[start..start + len]
    }

    pub fn end(self) -> usize {
        self.pos
    }
}

/// Reads what a `Serializer` wrote. Callers guarantee the buffer is long enough.
pub(crate) struct Deserializer<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    pub fn deserialize_u8(&mut self) -> u8 {
        let val = u8::from_be_bytes(
            self.buffer[self.pos..self.pos + U8_SIZE]
                .try_into()
                .unwrap(),
        );
        self.pos += U8_SIZE;
        val
    }

    pub fn deserialize_u16(&mut self) -> u16 {
        let val = u16::from_be_bytes(
            self.buffer[self.pos..self.pos + U16_SIZE]
                .try_into()
                .unwrap(),
        );
        self.pos += U16_SIZE;
        val
    }

    pub fn deserialize_u32(&mut self) -> u32 {
        let val = u32::from_be_bytes(
            self.buffer[self.pos..self.pos + U32_SIZE]
                .try_into()
                .unwrap(),
        );
        self.pos += U32_SIZE;
        val
    }

    pub fn deserialize_u64(&mut self) -> u64 {
        let val = u64::from_be_bytes(
            self.buffer[self.pos..self.pos + U64_SIZE]
                .try_into()
                .unwrap(),
        );
        self.pos += U64_SIZE;
        val
    }

    pub fn deserialize_f64(&mut self) -> f64 {
        let val = f64::from_be_bytes(
            self.buffer[self.pos..self.pos + F64_SIZE]
                .try_into()
                .unwrap(),
        );
        self.pos += F64_SIZE;
        val
    }

    pub fn deserialize_point(&mut self) -> Point {
        let x = self.deserialize_f64();
        let y = self.deserialize_f64();
        Point::new(x, y)
    }

    pub fn deserialize_rect(&mut self) -> Rect {
        let min = self.deserialize_point();
        let max = self.deserialize_point();
        Rect::new(min, max)
    }

    /// Returns `None` when the length prefix points past the buffer.
    pub fn deserialize_str(&mut self) -> Option<String> {
        let len = self.deserialize_u16() as usize;
        if self.remaining() < len {
            return None;
        }
        let bytes = self.take(len);
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn take(&mut self, len: usize) -> &'a [u8] {
        let bytes = &self.buffer[self.pos..self.pos + len];
        self.pos += len;
        bytes
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::{Deserializer, Serializer};
    use crate::tuple::point::{Point, Rect};

    #[test]
    fn reads_back_what_was_written() {
        let mut buffer = [0u8; 64];
        let mut serializer = Serializer::new(&mut buffer);
        serializer.serialize_u8(7);
        serializer.serialize_u16(513);
        serializer.serialize_u64(u64::MAX - 1);
        serializer.serialize_rect(&Rect::new(Point::new(-1.0, 2.0), Point::new(3.0, 4.5)));
        serializer.serialize_str("dept");
        let written = serializer.end();

        let mut deserializer = Deserializer::new(&buffer[..written]);
        assert_eq!(deserializer.deserialize_u8(), 7);
        assert_eq!(deserializer.deserialize_u16(), 513);
        assert_eq!(deserializer.deserialize_u64(), u64::MAX - 1);
        assert_eq!(
            deserializer.deserialize_rect(),
            Rect::new(Point::new(-1.0, 2.0), Point::new(3.0, 4.5))
        );
        assert_eq!(deserializer.deserialize_str().as_deref(), Some("dept"));
        assert_eq!(deserializer.remaining(), 0);
    }
}
