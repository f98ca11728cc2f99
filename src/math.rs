
//! Tiling arithmetic.

/// Whether to round up or down when dividing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundingMode {
    /// Round down.
    Down,

    /// Round up.
    Up,
}

impl RoundingMode {

    /// Divide, rounding according to this mode.
    pub fn divide(self, dividend: usize, divisor: usize) -> usize {
        match self {
            RoundingMode::Up => (dividend + divisor - 1) / divisor, // only works for positive numbers
            RoundingMode::Down => dividend / divisor,
        }
    }
}

/// Compute the number of tiles required to contain all pixels of one dimension.
pub fn compute_block_count(full_resolution: usize, block_size: usize) -> usize {
    // round up, because if the image is not evenly divisible by the blocks,
    // we add another block at the end (which is only partially used)
    RoundingMode::Up.divide(full_resolution, block_size)
}

/// Compute the packed byte count of a pixel run at a sub-byte or full-byte bit width.
pub fn compute_packed_byte_count(pixel_count: usize, bits_per_pixel: usize) -> usize {
    RoundingMode::Up.divide(pixel_count * bits_per_pixel, 8)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_count(){
        assert_eq!(compute_block_count(3, 2), 2);
        assert_eq!(compute_block_count(4, 2), 2);
        assert_eq!(compute_block_count(1000, 64), 16);
        assert_eq!(compute_block_count(1024, 64), 16);
        assert_eq!(compute_block_count(1025, 64), 17);
    }

    #[test]
    fn packed_bytes(){
        assert_eq!(compute_packed_byte_count(4096, 8), 4096);
        assert_eq!(compute_packed_byte_count(4096, 1), 512);
        assert_eq!(compute_packed_byte_count(3, 2), 1);
        assert_eq!(compute_packed_byte_count(5, 4), 3);
    }
}
