//! Network building blocks of the scene parser.

mod backbone;
mod conv_block;
mod head;

pub use backbone::*;
pub use conv_block::*;
pub use head::*;
