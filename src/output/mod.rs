//! Output module for progress reporting and result checking
//!
//! This module handles:
//! - Pushing task and quota progress to an observer
//! - Validating a finished output tree
//! - Printing tree statistics

mod progress;
mod validation;

pub use progress::{LogProgress, NoProgress, ProgressSink, ProgressUpdate};
pub use validation::{
    print_report, validate_output_tree, DependencyStats, TreeStatistics, ValidationReport,
};
