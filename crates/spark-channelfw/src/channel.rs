//! # 运行期通道契约
//!
//! 通道由 [`crate::ChannelFactory`] 产出，框架按链的管线顺序驱动其生命周期钩子。
//! 共享通道只会被初始化、启动、停止与销毁各一次，由框架依据引用它的链计算是否需要调用。

use std::sync::Arc;
use std::time::Duration;

use crate::discrimination::{DiscriminationProcess, Discriminator};
use crate::error::ChannelError;
use crate::registry::ChannelConfig;

/// 运行期通道。
///
/// # 教案式说明
/// - **意图 (Why)**：以一个小而闭合的能力集合描述处理阶段：生命周期四钩子、配置更新，
///   以及（入站协议通道可选的）甄别器；
/// - **契约 (What)**：
///   - `init`/`start` 返回 [`ChannelError::retryable`] 表示暂时性失败，链组启动可据此重试；
///   - `stop(timeout)` 中 `timeout > 0` 表示进入静默，存量工作可在该时长内排空；
///   - `discriminator` 返回值会以本通道的权重加入下方邻居的甄别流程；
///   - `discrimination_updated` 在本通道的甄别流程被替换时回调，通道应改用新流程；
/// - **风险 (Trade-offs)**：钩子在框架锁内执行，实现不得回调框架的变更接口。
pub trait Channel: Send {
    /// 初始化通道资源。
    fn init(&mut self) -> Result<(), ChannelError>;

    /// 开始对外服务。
    fn start(&mut self) -> Result<(), ChannelError>;

    /// 停止服务；`timeout` 为零时立即停止。
    fn stop(&mut self, timeout: Duration) -> Result<(), ChannelError>;

    /// 释放通道资源。
    fn destroy(&mut self) -> Result<(), ChannelError>;

    /// 通道配置的新快照。
    fn update(&mut self, config: &ChannelConfig) {
        let _ = config;
    }

    /// 供下方邻居使用的甄别器。
    fn discriminator(&self) -> Option<Arc<dyn Discriminator>> {
        None
    }

    /// 本通道的甄别流程被替换。
    fn discrimination_updated(&mut self, process: Arc<DiscriminationProcess>) {
        let _ = process;
    }
}
