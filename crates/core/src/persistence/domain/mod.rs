pub mod persistence_sink;
