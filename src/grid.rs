// grid.rs — execution grid geometry.
//
// A kernel is launched over a grid of work-items grouped into blocks
// (workgroups). The grid must be a whole number of blocks in every
// dimension, so the logical iteration space is rounded up per axis:
//
//   rounded = ceil(extent / block) * block
//
// Work-items beyond the logical extent still run; every kernel guards
// against them:
//
//   if gid.x >= width || gid.y >= height { return; }

use crate::error::{Error, Result};

/// Block (workgroup) shape: one extent for every axis, or one per axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockShape {
    Scalar(usize),
    PerAxis(Vec<usize>),
}

impl BlockShape {
    /// Expand to one extent per axis of a rank-`rank` shape.
    pub fn per_axis(&self, rank: usize) -> Result<Vec<usize>> {
        let dims = match self {
            BlockShape::Scalar(b) => vec![*b; rank],
            BlockShape::PerAxis(dims) => {
                if dims.len() != rank {
                    return Err(Error::RankMismatch { shape: rank, block: dims.len() });
                }
                dims.clone()
            }
        };
        if dims.iter().any(|&b| b == 0) {
            return Err(Error::InvalidBlock(dims));
        }
        Ok(dims)
    }
}

impl From<usize> for BlockShape {
    fn from(b: usize) -> Self {
        BlockShape::Scalar(b)
    }
}

impl From<Vec<usize>> for BlockShape {
    fn from(dims: Vec<usize>) -> Self {
        BlockShape::PerAxis(dims)
    }
}

impl<const N: usize> From<[usize; N]> for BlockShape {
    fn from(dims: [usize; N]) -> Self {
        BlockShape::PerAxis(dims.to_vec())
    }
}

/// Round `extent` up to the next multiple of `block` (`block > 0`).
///
/// Powers of two take the mask path: adding `block - 1` and clearing the
/// low bits is the same ceiling without a division.
#[inline]
pub fn round_up_extent(extent: usize, block: usize) -> usize {
    if block.is_power_of_two() {
        (extent + block - 1) & !(block - 1)
    } else {
        extent.div_ceil(block) * block
    }
}

/// Round every axis of `shape` up to a multiple of the matching block extent.
///
/// The result has the same rank as `shape`. Rounding an already-rounded
/// shape returns it unchanged.
pub fn round_up(shape: &[usize], block: &BlockShape) -> Result<Vec<usize>> {
    let dims = block.per_axis(shape.len())?;
    Ok(shape
        .iter()
        .zip(&dims)
        .map(|(&extent, &b)| round_up_extent(extent, b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two_block() {
        assert_eq!(round_up_extent(1, 4), 4);
        assert_eq!(round_up_extent(4, 4), 4);
        assert_eq!(round_up_extent(5, 4), 8);
        assert_eq!(round_up_extent(752, 32), 768);
    }

    #[test]
    fn test_non_power_of_two_block() {
        assert_eq!(round_up_extent(10, 3), 12);
        assert_eq!(round_up_extent(9, 3), 9);
        assert_eq!(round_up_extent(100, 12), 108);
    }

    #[test]
    fn test_scalar_block_applies_to_every_axis() {
        let g = round_up(&[13, 7, 1], &BlockShape::Scalar(4)).unwrap();
        assert_eq!(g, vec![16, 8, 4]);
    }

    #[test]
    fn test_per_axis_block() {
        let g = round_up(&[512, 511, 17], &BlockShape::from([4, 4, 4])).unwrap();
        assert_eq!(g, vec![512, 512, 20]);
        let g = round_up(&[30, 30], &BlockShape::from(vec![16, 6])).unwrap();
        assert_eq!(g, vec![32, 30]);
    }

    #[test]
    fn test_rank_mismatch_rejected() {
        let err = round_up(&[8, 8], &BlockShape::from([4, 4, 1])).unwrap_err();
        assert!(matches!(err, Error::RankMismatch { shape: 2, block: 3 }));
    }

    #[test]
    fn test_zero_block_rejected() {
        assert!(matches!(
            round_up(&[8], &BlockShape::Scalar(0)),
            Err(Error::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_rounding_properties() {
        // Idempotent, never shrinks, always a multiple of the block.
        for block in [1usize, 2, 3, 4, 5, 8, 12, 16, 64] {
            for extent in 1usize..200 {
                let r = round_up_extent(extent, block);
                assert!(r >= extent);
                assert_eq!(r % block, 0);
                assert!(r - extent < block);
                assert_eq!(round_up_extent(r, block), r);
            }
        }
    }
}
