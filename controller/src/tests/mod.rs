//! Test modules for the controller crate

mod common;

mod queue_tests;
mod reconfigure_tests;
mod recurrence_tests;
