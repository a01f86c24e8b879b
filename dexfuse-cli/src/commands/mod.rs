pub mod common;
pub mod fuse;
pub mod info;
pub mod methods;
pub mod protect;
