//! External service clients.

pub mod synthesis;

pub use synthesis::HttpSynthesisClient;
