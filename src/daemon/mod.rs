//! Process supervision: signal handling and the synthetic soak workload.

pub mod signals;
pub mod soak;
