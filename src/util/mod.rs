//! Small helpers shared by the CLI

pub mod time;
