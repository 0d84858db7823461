pub mod chunking;
pub mod fingerprint;
pub mod mining;
