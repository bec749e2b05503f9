pub mod file_manager;
pub mod heap;
pub(crate) mod utils;
