pub mod encoding;
pub mod media;
pub mod models;
pub mod normalize;
