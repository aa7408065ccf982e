pub mod connection;
pub mod source;

pub use source::ImapMailSource;
