use crate::ml::error::ModelError;

/// Board edge length (19x19)
pub const BOARD_SIZE: usize = 19;
pub const NUM_CELLS: usize = BOARD_SIZE * BOARD_SIZE;
/// 8 history planes per colour + side to move
pub const NUM_PLANES: usize = 17;
pub const FEATURE_LEN: usize = NUM_CELLS * NUM_PLANES;
/// One score per cell plus pass
pub const POLICY_WIDTH: usize = NUM_CELLS + 1;
pub const PASS_INDEX: usize = NUM_CELLS;

const WORDS: usize = (FEATURE_LEN + 63) / 64;

/// Bit-packed plane stack of one position.
///
/// Bit order follows the flat `[19 * 19 * 17]` input vector: bit
/// `cell * NUM_PLANES + plane`, where `cell = y * 19 + x`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EncodedBoard {
    bits: [u64; WORDS],
}

impl EncodedBoard {
    /// All planes cleared
    pub fn empty() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Pack a flat boolean feature vector of exactly `FEATURE_LEN` entries.
    pub fn from_bools(features: &[bool]) -> Result<Self, ModelError> {
        if features.len() != FEATURE_LEN {
            return Err(ModelError::InvalidArgument(format!(
                "board features must have {} entries, got {}",
                FEATURE_LEN,
                features.len()
            )));
        }

        let mut board = Self::empty();
        for (idx, &on) in features.iter().enumerate() {
            if on {
                board.bits[idx / 64] |= 1u64 << (idx % 64);
            }
        }
        Ok(board)
    }

    pub fn to_bools(&self) -> Vec<bool> {
        (0..FEATURE_LEN).map(|idx| self.bit(idx)).collect()
    }

    pub fn get(&self, plane: usize, cell: usize) -> bool {
        self.bit(Self::index(plane, cell))
    }

    pub fn set(&mut self, plane: usize, cell: usize, on: bool) {
        let idx = Self::index(plane, cell);
        if on {
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        } else {
            self.bits[idx / 64] &= !(1u64 << (idx % 64));
        }
    }

    /// Fill a whole plane, e.g. the side-to-move plane.
    pub fn fill_plane(&mut self, plane: usize, on: bool) {
        for cell in 0..NUM_CELLS {
            self.set(plane, cell, on);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of set cells in one plane
    pub fn plane_count(&self, plane: usize) -> usize {
        (0..NUM_CELLS).filter(|&cell| self.get(plane, cell)).count()
    }

    fn bit(&self, idx: usize) -> bool {
        self.bits[idx / 64] >> (idx % 64) & 1 == 1
    }

    fn index(plane: usize, cell: usize) -> usize {
        assert!(plane < NUM_PLANES, "plane {} out of range", plane);
        assert!(cell < NUM_CELLS, "cell {} out of range", cell);
        cell * NUM_PLANES + plane
    }
}

impl Default for EncodedBoard {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for EncodedBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedBoard")
            .field("set_bits", &self.count_ones())
            .finish()
    }
}
