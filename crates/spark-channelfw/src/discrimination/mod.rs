//! # 甄别引擎
//!
//! ## 核心意图（Why）
//! - 多条入站链共享同一个传输通道时，传输通道本身不理解协议；由每条链在其上方放置的协议
//!   通道提供“甄别器”，逐个连接投票决定数据应交给谁；
//! - 协议：“问所有人，取第一个 YES，记住 NO，只对 MAYBE 重试”。
//!
//! ## 行为契约（What）
//! - [`Vote`]：单个甄别器的投票；
//! - [`DiscriminationStatus`]：一次甄别调用的结果，`Again` 表示需要更多数据；
//! - [`DiscriminationProcess`]：按权重降序排列的甄别器集合，数据类型在加入时强制一致；
//! - 每个虚拟连接的投票状态保存在 [`crate::VirtualConnection`] 上，连接之间互不共享。

mod process;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

pub use process::DiscriminationProcess;

use crate::connection::VirtualConnection;
use crate::types::TypeToken;

/// 运行通道上可原子替换的甄别流程。
///
/// 数据路径通过 `load()` 无锁读取当前流程；框架在修改时整体替换为新的已启动流程。
pub type DiscriminationHandle = Arc<ArcSwap<DiscriminationProcess>>;

/// 甄别器投票。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Vote {
    /// 数据属于本通道。
    Yes,
    /// 数据不属于本通道，之后不再询问。
    No,
    /// 数据不足以判断，需要更多数据。
    Maybe,
}

/// 一次甄别调用的结果。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DiscriminationStatus {
    /// 已选定目标通道，连接链路已设置。
    Success,
    /// 仍有甄别器未决，调用方需携带更多数据再次调用。
    Again,
    /// 没有任何通道接受该连接。
    Failure,
}

/// 协议通道为其下方邻居提供的甄别器。
///
/// # 教案式说明
/// - **契约 (What)**：`discriminatory_type` 必须与所在甄别流程的数据类型一致；
///   `discriminate` 只能读取数据，不得消费；`connection_link` 在投出 YES 后被调用一次，
///   返回承接该连接的上层链路；
/// - **风险 (Trade-offs)**：同一甄别器会被多个连接并发调用，实现需保持无状态或自行同步。
pub trait Discriminator: Send + Sync {
    /// 所属通道名，同时作为虚拟连接上投票状态的键。
    fn channel_name(&self) -> &str;

    /// 消费的甄别数据类型。
    fn discriminatory_type(&self) -> TypeToken;

    /// 对数据投票。
    fn discriminate(&self, vc: &VirtualConnection, data: &dyn Any) -> Vote;

    /// 承接连接的上层链路。
    fn connection_link(&self, vc: &VirtualConnection) -> Arc<dyn ConnectionLink>;
}

/// 上层通道为单个连接提供的链路。
pub trait ConnectionLink: Send + Sync + fmt::Debug {
    /// 链路所属通道名。
    fn channel_name(&self) -> &str;
}

/// 设备侧链路：甄别成功后指向选中的上层链路。
#[derive(Debug, Default)]
pub struct DeviceLink {
    application: Option<Arc<dyn ConnectionLink>>,
}

impl DeviceLink {
    /// 创建尚未绑定上层的链路。
    pub fn new() -> Self {
        Self::default()
    }

    /// 已绑定的上层链路。
    pub fn application_link(&self) -> Option<&Arc<dyn ConnectionLink>> {
        self.application.as_ref()
    }

    /// 绑定上层链路。
    pub fn set_application_link(&mut self, link: Arc<dyn ConnectionLink>) {
        self.application = Some(link);
    }
}
