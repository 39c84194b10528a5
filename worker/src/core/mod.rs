//! Deterministic, pure logic shared by the worker.
//!
//! Core modules must be free of I/O side effects beyond reading from a
//! caller-supplied reader. They are fully testable in isolation.

pub mod output_name;
pub mod scan;
pub mod testfile;
pub mod types;
