pub mod backload;
pub mod info;
pub mod records;
pub mod system;
pub mod tasks;
pub mod workflow;
