//! Application-level orchestration.
//!
//! This module owns the job lifecycle (submit, poll, teardown). The CLI layer talks
//! to it only through `UiCommand`s and reads state back from `JobEvent`s.

mod controller;

pub(crate) use controller::{run_controller, UiCommand};
