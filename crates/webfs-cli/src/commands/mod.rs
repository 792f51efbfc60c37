pub mod mount;
pub mod serve;
