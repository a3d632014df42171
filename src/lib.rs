// A SIP event notification (RFC 6665) core in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod dialog;
pub mod error;
pub mod event;
pub mod rsip_ext;
pub mod subscription;
pub mod timer;
pub mod transaction;
pub mod useragent;
pub use useragent::UserAgentBuilder;
