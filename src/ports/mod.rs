pub mod definition_sink;
pub mod script_engine;
pub mod static_files;
