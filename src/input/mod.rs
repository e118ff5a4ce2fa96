//! Upstream detection input.

mod parser;

pub use parser::{collect_input_files, parse_detection_file, parse_inputs};
