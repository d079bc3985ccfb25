pub mod strings;

pub use strings::{join_str, split_str};
