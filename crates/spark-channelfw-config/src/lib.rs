//! # spark-channelfw-config
//!
//! ## 定位与职责（Why）
//! - 通道框架本身只暴露逐条的注册与生命周期操作；本 crate 把一份声明式的属性表
//!   （`channel.*`、`chain.*`、`group.*`、`factory.*`、`endpoint.*`）落到框架上；
//! - 配置热更新时比较新旧两张表，只重建结构发生变化的链。
//!
//! ## 架构嵌入（Where）
//! - `map` 模块定义 [`PropertyMap`] 与 TOML 解析；
//! - `loader` 模块提供 [`ConfigLoader`]，按端点、工厂、通道、链、链组的顺序增量应用；
//! - `error` 模块区分属性表本身的错误与框架拒绝的条目。
//!
//! ## 风险提示（Trade-offs）
//! - 装载不是事务：首个失败即返回，之前已应用的条目保持生效。

pub mod error;
pub mod loader;
pub mod map;

pub use error::{ConfigError, Result};
pub use loader::{ChangeSummary, ConfigLoader};
pub use map::{Category, PropertyMap};
