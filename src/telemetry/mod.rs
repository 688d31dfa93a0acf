//! 遥测查询：单飞缓存、查询发起方与结果表

pub mod cache;
pub mod issuer;
pub mod table;

pub use cache::{CacheError, TelemetryCache, DEFAULT_CACHE_TTL};
pub use issuer::{ConnectionSettings, HttpQueryIssuer, QueryIssuer, QueryIssuerSettings};
pub use table::{TableShapeError, TelemetryTable};
