// ABOUTME: Library half of the coderun CLI: substrate selection and argument parsing
// ABOUTME: Kept out of the binary so it can be unit tested

pub mod config;
pub mod request;
