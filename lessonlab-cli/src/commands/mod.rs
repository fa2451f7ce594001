pub mod assign;
pub mod config;
pub mod records;
pub mod simulate;
