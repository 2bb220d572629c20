use std::fmt;

use bitarray::BitArray;

/// Storage size of every binary descriptor row.
///
/// Shorter descriptors (BRIEF/ORB use 32 bytes, AKAZE 61) leave the trailing
/// bytes zeroed, which does not change Hamming distances.
pub const BINARY_DESCRIPTOR_BYTES: usize = 512 / u8::BITS as usize;
pub type BinaryDescriptor = [u8; BINARY_DESCRIPTOR_BYTES];

pub const FLOAT_DESCRIPTOR_LEN: usize = 128;
pub type FloatDescriptor = [f32; FLOAT_DESCRIPTOR_LEN];

/// Descriptor family, which decides the distance norm used for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorCategory {
    /// Bit strings compared with the Hamming distance
    Binary,
    /// Gradient histograms compared with the L2 distance
    Hog,
}

impl DescriptorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorCategory::Binary => "DES_BINARY",
            DescriptorCategory::Hog => "DES_HOG",
        }
    }
}

impl fmt::Display for DescriptorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One descriptor row per keypoint
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    Binary(Vec<BinaryDescriptor>),
    Float(Vec<FloatDescriptor>),
}

impl Default for Descriptors {
    fn default() -> Self {
        Descriptors::Binary(Vec::new())
    }
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Binary(rows) => rows.len(),
            Descriptors::Float(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn category(&self) -> DescriptorCategory {
        match self {
            Descriptors::Binary(_) => DescriptorCategory::Binary,
            Descriptors::Float(_) => DescriptorCategory::Hog,
        }
    }
}

pub fn hamming_distance(a: &BinaryDescriptor, b: &BinaryDescriptor) -> u32 {
    BitArray::new(*a).distance(&BitArray::new(*b))
}

pub fn euclidean_distance(a: &FloatDescriptor, b: &FloatDescriptor) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Writes comparison results into a descriptor row, most significant bit first
pub(crate) struct BitWriter {
    bytes: BinaryDescriptor,
    position: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            bytes: [0; BINARY_DESCRIPTOR_BYTES],
            position: 0,
        }
    }

    pub fn push(&mut self, bit: bool) {
        debug_assert!(self.position < BINARY_DESCRIPTOR_BYTES * 8);
        if bit {
            self.bytes[self.position / 8] |= 0x80 >> (self.position % 8);
        }
        self.position += 1;
    }

    pub fn finish(self) -> BinaryDescriptor {
        self.bytes
    }
}

/// Reads bit `index` of a row as written by [`BitWriter`]
pub(crate) fn bit(descriptor: &BinaryDescriptor, index: usize) -> bool {
    descriptor[index / 8] & (0x80 >> (index % 8)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_counts_differing_bits() {
        let mut a = [0u8; BINARY_DESCRIPTOR_BYTES];
        let mut b = [0u8; BINARY_DESCRIPTOR_BYTES];
        a[0] = 0b1111_0000;
        b[0] = 0b0000_0000;
        a[63] = 0b0000_0001;
        assert_eq!(hamming_distance(&a, &b), 5);
        assert_eq!(hamming_distance(&a, &a), 0);
        b[63] = 0b0000_0001;
        assert_eq!(hamming_distance(&a, &b), 4);
    }

    #[test]
    fn bit_writer_is_msb_first() {
        let mut writer = BitWriter::new();
        writer.push(true);
        writer.push(false);
        writer.push(true);
        let row = writer.finish();
        assert_eq!(row[0], 0b1010_0000);
        assert!(bit(&row, 0));
        assert!(!bit(&row, 1));
        assert!(bit(&row, 2));
    }

    #[test]
    fn euclidean_distance_of_unit_offset() {
        let a = [0.0; FLOAT_DESCRIPTOR_LEN];
        let mut b = [0.0; FLOAT_DESCRIPTOR_LEN];
        b[5] = 3.0;
        b[6] = 4.0;
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn sift_rows_are_hog_category() {
        assert_eq!(
            Descriptors::Float(vec![]).category(),
            DescriptorCategory::Hog
        );
        assert_eq!(DescriptorCategory::Binary.to_string(), "DES_BINARY");
    }
}
