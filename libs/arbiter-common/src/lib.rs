pub mod protocol;
pub mod types;

#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(feature = "redis-store")]
pub mod store;
