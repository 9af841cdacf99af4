pub mod config;
pub mod stream;

pub use config::*;
pub use stream::*;
