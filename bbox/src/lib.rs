//! Safe bounding box types and functions.

mod common;

pub mod rect;
pub use rect::*;

pub mod tlbr;
pub use tlbr::*;

pub mod prelude {
    pub use crate::rect::Rect;
}
