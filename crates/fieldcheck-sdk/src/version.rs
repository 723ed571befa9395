//! SDK 版本与存储 schema 元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Schema Version** → `storage::migrate` 中的迁移步骤列表

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 当前 SDK 支持的最高本地存储 schema 版本。
/// 启动时若存储中记录的版本高于此值则拒绝打开（防 downgrade 导致格式不兼容）。
pub const STORE_SCHEMA_VERSION: u32 = 2;
