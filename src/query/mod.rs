// Synchronous lookups over the loaded cache

pub mod engine;

pub use engine::QueryEngine;
