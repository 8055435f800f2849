pub mod image;
pub mod json;
