//! # 链事件监听与扇出
//!
//! ## 核心意图（Why）
//! - 运维组件需要感知链的生命周期变化；监听器可直接挂在链上、挂在链组上（扇出到全部成员链），
//!   或以 [`ALL_CHAINS`] 挂在框架全局（覆盖现有与未来的所有链）；
//! - 同一监听器经由多条路径挂到同一条链时只登记一次，以引用计数记录挂载路径数。
//!
//! ## 行为契约（What）
//! - 事件在框架锁内收集，释放锁之后在调用线程上同步派发；静默完成事件在定时器的执行上下文
//!   中派发；
//! - 监听器身份以 `Arc` 指针判定。

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::registry::ChainConfig;

/// 全局监听器的哨兵链名。
pub const ALL_CHAINS: &str = "*";

/// 链事件监听器；所有回调默认为空实现。
///
/// # 教案式说明
/// - **契约 (What)**：回调在框架锁之外执行，可以安全地查询框架状态；
/// - **风险 (Trade-offs)**：回调在发起操作的线程上同步执行，耗时回调会拖慢调用方。
pub trait ChainEventListener: Send + Sync {
    /// 链完成初始化。
    fn chain_initialized(&self, chain: &ChainConfig) {
        let _ = chain;
    }

    /// 链开始服务。
    fn chain_started(&self, chain: &ChainConfig) {
        let _ = chain;
    }

    /// 链进入静默。
    fn chain_quiesced(&self, chain: &ChainConfig) {
        let _ = chain;
    }

    /// 链停止服务，回到已初始化状态。
    fn chain_stopped(&self, chain: &ChainConfig) {
        let _ = chain;
    }

    /// 链被销毁。
    fn chain_destroyed(&self, chain: &ChainConfig) {
        let _ = chain;
    }

    /// 链的通道列表被替换。
    fn chain_updated(&self, chain: &ChainConfig) {
        let _ = chain;
    }

    /// 链启动失败；`attempts_left` 为零表示不再重试，负值表示不限次数。
    fn chain_start_failed(&self, chain: &ChainConfig, attempts_made: u32, attempts_left: i32) {
        let _ = (chain, attempts_made, attempts_left);
    }
}

/// 链事件。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainEvent {
    Initialized,
    Started,
    Quiesced,
    Stopped,
    Destroyed,
    Updated,
    StartFailed { attempts_made: u32, attempts_left: i32 },
}

impl ChainEvent {
    fn deliver(self, listener: &dyn ChainEventListener, chain: &ChainConfig) {
        match self {
            ChainEvent::Initialized => listener.chain_initialized(chain),
            ChainEvent::Started => listener.chain_started(chain),
            ChainEvent::Quiesced => listener.chain_quiesced(chain),
            ChainEvent::Stopped => listener.chain_stopped(chain),
            ChainEvent::Destroyed => listener.chain_destroyed(chain),
            ChainEvent::Updated => listener.chain_updated(chain),
            ChainEvent::StartFailed {
                attempts_made,
                attempts_left,
            } => listener.chain_start_failed(chain, attempts_made, attempts_left),
        }
    }
}

fn same_listener(a: &Arc<dyn ChainEventListener>, b: &Arc<dyn ChainEventListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// 带挂载计数的监听器集合。
#[derive(Clone, Default)]
pub(crate) struct ListenerSet {
    entries: Vec<(Arc<dyn ChainEventListener>, usize)>,
}

impl ListenerSet {
    /// 增加一条挂载路径，返回是否为首次挂载。
    pub(crate) fn attach(&mut self, listener: &Arc<dyn ChainEventListener>) -> bool {
        if let Some((_, count)) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| same_listener(existing, listener))
        {
            *count += 1;
            return false;
        }
        self.entries.push((Arc::clone(listener), 1));
        true
    }

    /// 减少一条挂载路径，返回是否已完全移除。
    pub(crate) fn detach(&mut self, listener: &Arc<dyn ChainEventListener>) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|(existing, _)| same_listener(existing, listener))
        else {
            return false;
        };
        let count = &mut self.entries[index].1;
        *count -= 1;
        if *count == 0 {
            self.entries.remove(index);
            return true;
        }
        false
    }

    /// 无论挂载路径数，彻底移除。
    pub(crate) fn purge(&mut self, listener: &Arc<dyn ChainEventListener>) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(existing, _)| !same_listener(existing, listener));
        before != self.entries.len()
    }

    pub(crate) fn contains(&self, listener: &Arc<dyn ChainEventListener>) -> bool {
        self.entries
            .iter()
            .any(|(existing, _)| same_listener(existing, listener))
    }

    pub(crate) fn attachments(&self, listener: &Arc<dyn ChainEventListener>) -> usize {
        self.entries
            .iter()
            .find(|(existing, _)| same_listener(existing, listener))
            .map_or(0, |(_, count)| *count)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn ChainEventListener>> {
        self.entries
            .iter()
            .map(|(listener, _)| Arc::clone(listener))
            .collect()
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<usize> = self.entries.iter().map(|(_, count)| *count).collect();
        f.debug_struct("ListenerSet").field("attachments", &counts).finish()
    }
}

struct Notice {
    chain: ChainConfig,
    event: ChainEvent,
    listeners: Vec<Arc<dyn ChainEventListener>>,
}

/// 锁内收集、锁外派发的事件队列。
#[derive(Default)]
pub(crate) struct EventQueue {
    notices: Vec<Notice>,
}

impl EventQueue {
    pub(crate) fn push(&mut self, chain: &ChainConfig, listeners: &ListenerSet, event: ChainEvent) {
        if listeners.is_empty() {
            return;
        }
        self.notices.push(Notice {
            chain: chain.clone(),
            event,
            listeners: listeners.listeners(),
        });
    }

    /// 依收集顺序派发全部事件。
    pub(crate) fn dispatch(self) {
        for notice in self.notices {
            trace!(chain = notice.chain.name(), event = ?notice.event, "dispatching chain event");
            for listener in &notice.listeners {
                notice.event.deliver(listener.as_ref(), &notice.chain);
            }
        }
    }
}
