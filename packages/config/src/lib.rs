// ABOUTME: Shared configuration primitives for AppForge packages
// ABOUTME: Exposes environment variable names and validated env parsing helpers

pub mod constants;
pub mod env;
