/// Growable write buffer for serializing packet fields before framing.
pub struct Buffer {
    array: Vec<u8>,
    position: usize,
}

impl Buffer {
    pub fn new(init_size: usize) -> Buffer {
        Buffer {
            array: vec![0_u8; init_size.max(1)],
            position: 0,
        }
    }

    pub fn write_byte(&mut self, value: u8) {
        if self.array.len() == self.position {
            self.array.resize(self.array.len() * 2, 0);
        }
        self.array[self.position] = value;
        self.position += 1;
    }

    /// The bytes written so far.
    pub fn take(&self) -> &[u8] {
        &self.array[0..self.position]
    }
}
