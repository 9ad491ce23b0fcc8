pub mod compliance;
pub mod detection;
pub mod persistence;
pub mod pipeline;
pub mod shared;
pub mod video;
