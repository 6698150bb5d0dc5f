//! # 配置注册表：通道、链与链组
//!
//! ## 核心意图（Why）
//! - 注册表只保存“定义”：通道由哪个工厂产出、链由哪些通道组成、链组包含哪些链；
//! - 运行期实例（运行链、运行通道、工厂单例）由 [`crate::ChannelFramework`] 在同一把锁下维护，
//!   因而读操作永远不会看到引用了“正在被移除的通道”的链。
//!
//! ## 行为契约（What）
//! - 三类配置均以不可变快照形式对外暴露，修改通过框架入口完成；
//! - 链装配时执行连贯性检查（相邻通道的接口令牌必须匹配），失败时不创建任何部分链。

mod chain;
mod channel;
mod group;

pub use chain::ChainConfig;
pub use channel::ChannelConfig;
pub use group::ChainGroupConfig;

pub(crate) use chain::check_coherency;
