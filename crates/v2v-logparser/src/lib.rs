//! v2v-logparser: tails the converter's two concurrent logs (a free-form text
//! log and a line-delimited JSON event log) and reconciles their content into
//! the State Store (SPEC_FULL.md §4.3).

mod parser;

pub use parser::OutputParser;
