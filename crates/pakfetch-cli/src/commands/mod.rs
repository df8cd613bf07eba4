pub mod fetch;
pub mod version;
