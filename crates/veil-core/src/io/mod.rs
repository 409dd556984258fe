//! Stream primitives shared by the server core.

mod rewind;
mod splice;

pub use rewind::RewindStream;
pub use splice::{splice_bidirectional, SpliceStats};
