//! Pure text-processing primitives shared by the agent runtime.
//!
//! Nothing here performs I/O: the balanced scanner backs the inline
//! tool-call codec and the answer extractor backs final-answer detection
//! and task post-processing.

pub mod answer;
pub mod balanced;

pub use answer::{BOXED_MARKER, best_effort_answer, extract_boxed, extract_final_answer, has_boxed};
pub use balanced::{Quoting, find_json_object, matching_close};
