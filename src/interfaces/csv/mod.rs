//! CSV surface of the command line: webhook events in, run summaries out.

pub mod summary_writer;
pub mod webhook_reader;
