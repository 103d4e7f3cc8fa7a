pub mod job;
pub mod manifest;
pub mod pattern;
pub mod submission;
pub mod webhook;
