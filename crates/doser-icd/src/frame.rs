//! Bus frame object

use heapless::Vec;

use crate::FRAME_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidLength;

/// A classic bus frame: numeric identifier plus up to 8 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    pub id: u32,
    pub data: Vec<u8, FRAME_CAPACITY>,
}

impl Frame {
    /// Creates a frame from a slice of at most 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, InvalidLength> {
        let data = Vec::from_slice(data).map_err(|_| InvalidLength)?;
        Ok(Self { id, data })
    }

    /// Creates a frame of `length` zero bytes.
    pub fn new_zeros(id: u32, length: usize) -> Result<Self, InvalidLength> {
        let mut data = Vec::new();
        data.resize(length, 0).map_err(|_| InvalidLength)?;
        Ok(Self { id, data })
    }

    /// Data length code.
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl core::ops::Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_payload() {
        assert_eq!(Frame::new(0x07, &[0; 9]), Err(InvalidLength));
        assert_eq!(Frame::new_zeros(0x07, 9), Err(InvalidLength));
        assert_eq!(Frame::new(0x07, &[0; 8]).map(|f| f.dlc()), Ok(8));
    }
}
