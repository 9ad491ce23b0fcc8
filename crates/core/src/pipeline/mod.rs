pub mod frame_processor;
pub mod job;
pub mod job_orchestrator;
pub mod pipeline_logger;
pub mod process_video_use_case;
