// ABOUTME: Shared configuration surface for Coderun packages
// ABOUTME: Re-exports the environment variable names read by the engine and CLI

pub mod constants;
