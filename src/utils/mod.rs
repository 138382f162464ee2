// Utility modules for common functionality
pub mod command;
pub mod constants;
pub mod logger;
pub mod process;
pub mod validation;
