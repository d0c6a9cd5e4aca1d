pub mod coordinator;
pub mod scheduler;
