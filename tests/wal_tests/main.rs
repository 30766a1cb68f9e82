//! WAL test suite

mod entry_tests;
mod recovery_tests;
mod writer_tests;
