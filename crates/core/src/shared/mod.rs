pub mod constants;
pub mod detection;
pub mod engine_config;
pub mod frame;
pub mod geometry;
pub mod perspective;
pub mod sync;
pub mod video_metadata;
