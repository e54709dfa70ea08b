//! File I/O utilities for document uploads and persisted artifacts.

mod reader;

pub use reader::{FileReader, read_to_bytes, read_to_string, write_string};
