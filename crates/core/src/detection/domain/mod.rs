pub mod detection_merger;
pub mod identity_stabilizer;
