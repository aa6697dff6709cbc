pub mod assembler;
pub mod client;

pub use assembler::{assemble, AssembledResponse, ChunkRecord};
pub use client::{UpstreamClient, UpstreamOutcome};
