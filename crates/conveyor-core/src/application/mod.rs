/// Workflow executor and worker pool
pub mod executor;
