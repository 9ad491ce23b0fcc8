pub mod buffered_sink;
pub mod json_file_sink;
