pub mod board;
pub mod types;

pub use board::{
    EncodedBoard, BOARD_SIZE, FEATURE_LEN, NUM_CELLS, NUM_PLANES, PASS_INDEX, POLICY_WIDTH,
};
pub use types::Device;
