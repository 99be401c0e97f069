// Utility modules for common functionality
pub mod command;
pub mod constants;
