pub mod buffer;
pub mod codec;
pub mod mesh;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
