//! Board plane arrangement for network input
//!
//! Unpacks bit-packed positions into the dense f32 tensor layout the bound
//! runtime expects.

use crate::core::{EncodedBoard, BOARD_SIZE, FEATURE_LEN, NUM_CELLS, NUM_PLANES};
use crate::ml::config::TensorLayout;
use ndarray::Array4;
use rayon::prelude::*;

/// Batches at least this large are unpacked in parallel
const PARALLEL_THRESHOLD: usize = 32;

pub struct PlaneEncoder;

impl PlaneEncoder {
    /// Build the `[N, C, H, W]` or `[N, H, W, C]` input tensor for a batch.
    pub fn to_tensor(batch: &[EncodedBoard], layout: TensorLayout) -> Array4<f32> {
        let mut data = vec![0.0f32; batch.len() * FEATURE_LEN];

        if batch.len() >= PARALLEL_THRESHOLD {
            data.par_chunks_mut(FEATURE_LEN)
                .zip(batch.par_iter())
                .for_each(|(slot, board)| Self::write_position(board, layout, slot));
        } else {
            for (slot, board) in data.chunks_mut(FEATURE_LEN).zip(batch) {
                Self::write_position(board, layout, slot);
            }
        }

        let shape = match layout {
            TensorLayout::Nchw => (batch.len(), NUM_PLANES, BOARD_SIZE, BOARD_SIZE),
            TensorLayout::Nhwc => (batch.len(), BOARD_SIZE, BOARD_SIZE, NUM_PLANES),
        };
        Array4::from_shape_vec(shape, data).expect("batch.len() * FEATURE_LEN elements")
    }

    /// Dense values of a single position, in `layout` order
    pub fn encode(board: &EncodedBoard, layout: TensorLayout) -> Vec<f32> {
        let mut slot = vec![0.0f32; FEATURE_LEN];
        Self::write_position(board, layout, &mut slot);
        slot
    }

    fn write_position(board: &EncodedBoard, layout: TensorLayout, slot: &mut [f32]) {
        for cell in 0..NUM_CELLS {
            for plane in 0..NUM_PLANES {
                if board.get(plane, cell) {
                    slot[Self::offset(layout, plane, cell)] = 1.0;
                }
            }
        }
    }

    fn offset(layout: TensorLayout, plane: usize, cell: usize) -> usize {
        match layout {
            TensorLayout::Nchw => plane * NUM_CELLS + cell,
            TensorLayout::Nhwc => cell * NUM_PLANES + plane,
        }
    }
}
