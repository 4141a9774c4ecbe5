pub mod env;
pub mod fs_atomic;
