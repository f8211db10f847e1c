//! Cache management module

mod lifecycle;
mod manager;

pub use lifecycle::{GenerationInfo, GenerationState};
pub use manager::{AssetCacheManager, CacheStats, Handled, InstallReport, ResponseSource};
