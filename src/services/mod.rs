pub mod archive;
pub mod auth;
pub mod broadcast;
pub mod buffer;
pub mod sync;
