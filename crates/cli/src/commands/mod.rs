pub mod deploy;
pub mod workload;
