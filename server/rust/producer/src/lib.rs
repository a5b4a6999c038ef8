pub mod infrastructure;
pub mod runner;
pub mod usecase;
