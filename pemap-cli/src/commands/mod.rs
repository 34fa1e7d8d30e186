pub mod common;
pub mod info;
pub mod stage;
