//! # 虚拟连接
//!
//! 虚拟连接是流经链与甄别流程的逐连接上下文：携带一个键值暂存区，以及（入站时）
//! 甄别投票状态。出站连接额外持有对出站工厂的租约，连接销毁或被丢弃时自动归还。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::discrimination::Vote;
use crate::framework::OutboundLease;
use crate::types::FlowType;

type StateMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// 逐连接上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：让传输通道与协议通道在不了解彼此的情况下共享连接级数据；
/// - **契约 (What)**：
///   - `id` 在同一框架实例内唯一；
///   - 甄别状态只在 `Again` 之后存在，`Success`/`Failure` 会清除它；
///   - 出站连接在 [`destroy`](Self::destroy) 或被丢弃时归还一次工厂引用；
/// - **风险 (Trade-offs)**：暂存区使用 `Mutex`，单连接上的并发访问会串行化，
///   不同连接之间互不影响。
pub struct VirtualConnection {
    id: u64,
    chain: Option<String>,
    flow: Option<FlowType>,
    state: Mutex<StateMap>,
    discrimination: Mutex<Option<HashMap<String, Vote>>>,
    lease: Option<OutboundLease>,
}

impl VirtualConnection {
    /// 创建不隶属任何链的连接，常用于直接驱动甄别流程。
    pub fn detached(id: u64) -> Self {
        Self::build(id, None, None, None)
    }

    pub(crate) fn inbound(id: u64) -> Self {
        Self::build(id, None, Some(FlowType::Inbound), None)
    }

    pub(crate) fn outbound(id: u64, chain: &str, lease: OutboundLease) -> Self {
        Self::build(
            id,
            Some(chain.to_owned()),
            Some(FlowType::Outbound),
            Some(lease),
        )
    }

    fn build(
        id: u64,
        chain: Option<String>,
        flow: Option<FlowType>,
        lease: Option<OutboundLease>,
    ) -> Self {
        Self {
            id,
            chain,
            flow,
            state: Mutex::new(HashMap::new()),
            discrimination: Mutex::new(None),
            lease,
        }
    }

    /// 连接标识。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 出站连接所属的链。
    pub fn chain(&self) -> Option<&str> {
        self.chain.as_deref()
    }

    /// 连接流向；游离连接为 `None`。
    pub fn flow(&self) -> Option<FlowType> {
        self.flow
    }

    /// 写入暂存值，返回是否覆盖了旧值。
    pub fn insert_state<T>(&self, key: &str, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.state
            .lock()
            .insert(key.to_owned(), Arc::new(value))
            .is_some()
    }

    /// 读取暂存值；类型不符时返回 `None`。
    pub fn state<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.state
            .lock()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// 删除暂存值。
    pub fn remove_state(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// 是否保留着未决的甄别投票。
    pub fn has_discrimination_state(&self) -> bool {
        self.discrimination.lock().is_some()
    }

    pub(crate) fn take_discrimination_state(&self) -> Option<HashMap<String, Vote>> {
        self.discrimination.lock().take()
    }

    pub(crate) fn store_discrimination_state(&self, votes: HashMap<String, Vote>) {
        *self.discrimination.lock() = Some(votes);
    }

    pub(crate) fn clear_discrimination_state(&self) {
        self.discrimination.lock().take();
    }

    /// 销毁连接；出站连接归还其工厂引用。
    pub fn destroy(self) {
        drop(self);
    }
}

impl fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("id", &self.id)
            .field("chain", &self.chain)
            .field("flow", &self.flow)
            .field("outbound_lease", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

/// 入站虚拟连接工厂。
///
/// 入站连接由传输通道在接受连接时创建，随后交给甄别流程；工厂不持有任何引用计数。
#[derive(Clone, Debug)]
pub struct InboundVcFactory {
    ids: Arc<AtomicU64>,
}

impl InboundVcFactory {
    pub(crate) fn new(ids: Arc<AtomicU64>) -> Self {
        Self { ids }
    }

    /// 创建入站连接。
    pub fn create_connection(&self) -> VirtualConnection {
        VirtualConnection::inbound(self.ids.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_map_is_typed() {
        let vc = VirtualConnection::detached(7);
        assert!(!vc.insert_state("remote", String::from("10.0.0.1")));
        assert_eq!(vc.state::<String>("remote").as_deref(), Some("10.0.0.1"));
        assert_eq!(vc.state::<u16>("remote"), None);
        assert!(vc.remove_state("remote"));
        assert!(!vc.remove_state("remote"));
    }

    #[test]
    fn inbound_factory_hands_out_distinct_ids() {
        let factory = InboundVcFactory::new(Arc::new(AtomicU64::new(1)));
        let first = factory.create_connection();
        let second = factory.create_connection();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.flow(), Some(FlowType::Inbound));
    }
}
