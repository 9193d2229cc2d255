//! The scene parser: an object detector that produces per-image box predictions.

mod common;
pub mod config;
pub mod image_list;
pub mod label;
pub mod loss;
pub mod model;
pub mod nms;
pub mod parser;

pub use config::SceneParserConfig;
pub use image_list::ImageList;
pub use label::{Annotation, Detection, Detections, ObjectLabel};
pub use loss::LossDict;
pub use parser::SceneParser;
