//! Spatial partition of the computational grid into processing blocks.

/// A rectangle of cells `n0..n1` × `m0..m1` processed in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Row-major block number.
    pub index: usize,
    pub n0: usize,
    pub n1: usize,
    pub m0: usize,
    pub m1: usize,
}

impl Block {
    pub fn rows(&self) -> usize {
        self.n1 - self.n0
    }

    pub fn cols(&self) -> usize {
        self.m1 - self.m0
    }

    pub fn cell_count(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn contains(&self, n: usize, m: usize) -> bool {
        (self.n0..self.n1).contains(&n) && (self.m0..self.m1).contains(&m)
    }
}

/// Split an `nmax × mmax` grid into row-major blocks of at most
/// `block_max_cells` cells.
///
/// Blocks are near-square with side `⌊√block_max_cells⌋`; when the grid is
/// narrower than that along one axis the block widens along the other.
pub fn partition_blocks(nmax: usize, mmax: usize, block_max_cells: usize) -> Vec<Block> {
    let max = block_max_cells.max(1);
    let side = (1..=max).take_while(|s| s * s <= max).last().unwrap_or(1);
    let (rows, cols) = if nmax < side {
        (nmax, (max / nmax.max(1)).min(mmax))
    } else if mmax < side {
        ((max / mmax.max(1)).min(nmax), mmax)
    } else {
        (side, side)
    };
    let (rows, cols) = (rows.max(1), cols.max(1));

    let mut blocks = Vec::new();
    for n0 in (0..nmax).step_by(rows) {
        for m0 in (0..mmax).step_by(cols) {
            blocks.push(Block {
                index: blocks.len(),
                n0,
                n1: (n0 + rows).min(nmax),
                m0,
                m1: (m0 + cols).min(mmax),
            });
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers_once(blocks: &[Block], nmax: usize, mmax: usize) -> bool {
        (0..nmax).all(|n| (0..mmax).all(|m| blocks.iter().filter(|b| b.contains(n, m)).count() == 1))
    }

    #[test]
    fn square_blocks_tile_the_grid() {
        let blocks = partition_blocks(10, 7, 9);
        assert!(blocks.iter().all(|b| b.cell_count() <= 9));
        assert!(covers_once(&blocks, 10, 7));
        assert_eq!(blocks[0], Block { index: 0, n0: 0, n1: 3, m0: 0, m1: 3 });
        assert_eq!(blocks[1].m0, 3);
    }

    #[test]
    fn narrow_grid_widens_blocks() {
        let blocks = partition_blocks(1, 100, 16);
        assert_eq!(blocks.len(), 7);
        assert_eq!(blocks[0].cols(), 16);
        assert!(covers_once(&blocks, 1, 100));
    }

    #[test]
    fn single_cell_blocks() {
        let blocks = partition_blocks(2, 3, 1);
        assert_eq!(blocks.len(), 6);
        assert_eq!((blocks[4].n0, blocks[4].m0), (1, 1));
    }

    #[test]
    fn whole_grid_in_one_block() {
        let blocks = partition_blocks(4, 5, 2000);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].cell_count(), 20);
    }
}
