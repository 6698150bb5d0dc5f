//! # 出站虚拟连接工厂
//!
//! ## 核心意图（Why）
//! - 大量调用方打开同一类下游连接时，只启动一次出站链并共享它；
//! - 工厂的引用计数 = 获取次数 + 存活连接数，归零时链被停止、销毁并移出运行表。
//!
//! ## 行为契约（What）
//! - [`ChannelFramework::get_outbound_vc_factory`] 对同一条链返回同一个工厂实例；
//! - [`OutboundVcFactory::create_connection`] 产出的连接持有一份租约，
//!   [`crate::VirtualConnection::destroy`] 或直接丢弃连接都会归还该租约；
//! - 工厂与租约只持有框架的弱引用，框架释放后归还操作静默失效；
//! - 也可以从入站链的 [`CfEndPoint`] 出发：按端点的出站定义复用或新建一条出站链。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::state::FrameworkState;
use super::{ChannelFramework, Inner};
use crate::connection::VirtualConnection;
use crate::endpoint::{CfEndPoint, OutboundChannelDef};
use crate::error::{FrameworkError, Result};
use crate::listener::EventQueue;
use crate::policy::ChainAdmissionPolicy;
use crate::registry::{ChainConfig, ChannelConfig};
use crate::types::{DEFAULT_DISC_WEIGHT, FlowType};

/// 出站表条目。
pub(crate) struct OutboundEntry {
    pub(crate) factory: Arc<OutboundVcFactory>,
    pub(crate) refs: usize,
}

/// 共享出站链的虚拟连接工厂。
pub struct OutboundVcFactory {
    id: u64,
    chain: String,
    inner: Weak<Inner>,
}

impl OutboundVcFactory {
    /// 所属出站链。
    pub fn chain_name(&self) -> &str {
        &self.chain
    }

    /// 当前引用计数；工厂已被拆除时为零。
    pub fn ref_count(&self) -> usize {
        let Some(inner) = self.inner.upgrade() else {
            return 0;
        };
        let state = inner.state.lock();
        state
            .outbound
            .get(&self.chain)
            .filter(|entry| entry.factory.id == self.id)
            .map_or(0, |entry| entry.refs)
    }

    /// 创建绑定到该链的出站连接，引用计数加一。
    ///
    /// 工厂已被拆除（计数归零或框架已清空）时返回 [`FrameworkError::Chain`]。
    pub fn create_connection(&self) -> Result<VirtualConnection> {
        let inner = self.inner.upgrade().ok_or_else(|| self.released())?;
        {
            let mut state = inner.state.lock();
            let entry = state
                .outbound
                .get_mut(&self.chain)
                .filter(|entry| entry.factory.id == self.id)
                .ok_or_else(|| self.released())?;
            entry.refs += 1;
        }
        let lease = OutboundLease {
            inner: Weak::clone(&self.inner),
            chain: self.chain.clone(),
            factory_id: self.id,
        };
        let id = inner.vc_ids.fetch_add(1, Ordering::Relaxed);
        debug!(chain = %self.chain, vc = id, "outbound connection created");
        Ok(VirtualConnection::outbound(id, &self.chain, lease))
    }

    /// 归还一次 [`ChannelFramework::get_outbound_vc_factory`] 取得的引用。
    pub fn destroy(&self) -> Result<()> {
        let inner = self.inner.upgrade().ok_or_else(|| self.released())?;
        if inner.release_outbound(&self.chain, self.id) {
            Ok(())
        } else {
            Err(self.released())
        }
    }

    fn released(&self) -> FrameworkError {
        FrameworkError::Chain {
            chain: self.chain.clone(),
            reason: "outbound virtual connection factory has been released".into(),
        }
    }
}

impl fmt::Debug for OutboundVcFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundVcFactory")
            .field("id", &self.id)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

/// 出站连接持有的工厂引用，丢弃时归还。
pub(crate) struct OutboundLease {
    inner: Weak<Inner>,
    chain: String,
    factory_id: u64,
}

impl Drop for OutboundLease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release_outbound(&self.chain, self.factory_id);
        }
    }
}

impl FrameworkState {
    /// 停止并销毁出站链，错误只记录日志。
    fn tear_down_outbound(&mut self, chain: &str, events: &mut EventQueue) {
        if self.chain_state(chain).is_running() {
            self.finish_stop(chain, events);
        }
        if let Err(error) = self.destroy_chain(chain, events) {
            warn!(chain, %error, "outbound chain teardown failed");
        }
    }
}

impl Inner {
    /// 归还一次引用；返回该工厂是否仍在出站表中。
    pub(crate) fn release_outbound(&self, chain: &str, factory_id: u64) -> bool {
        self.transact(|state, events| {
            let Some(entry) = state
                .outbound
                .get_mut(chain)
                .filter(|entry| entry.factory.id == factory_id)
            else {
                return false;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return true;
            }
            state.outbound.remove(chain);
            state.tear_down_outbound(chain, events);
            info!(chain, "outbound chain released");
            true
        })
    }
}

impl FrameworkState {
    /// 取得出站链的共享工厂，首次取得时启动链。
    fn acquire_outbound(
        &mut self,
        chain: &str,
        inner: Weak<Inner>,
        ids: &AtomicU64,
        events: &mut EventQueue,
    ) -> Result<Arc<OutboundVcFactory>> {
        if self.chain_entry(chain)?.config.flow() != FlowType::Outbound {
            return Err(FrameworkError::invalid_chain(chain, "chain is not outbound"));
        }
        if let Some(entry) = self.outbound.get_mut(chain) {
            entry.refs += 1;
            debug!(chain, refs = entry.refs, "outbound factory shared");
            return Ok(Arc::clone(&entry.factory));
        }

        match self.start_chain(chain, events) {
            Ok(_) if self.chain_state(chain).is_running() => {}
            Ok(_) => {
                self.tear_down_outbound(chain, events);
                return Err(FrameworkError::Chain {
                    chain: chain.to_owned(),
                    reason: "outbound chain is disabled".into(),
                });
            }
            Err(error) => {
                warn!(chain, %error, "outbound chain start failed");
                self.tear_down_outbound(chain, events);
                return Err(error);
            }
        }

        let factory = Arc::new(OutboundVcFactory {
            id: ids.fetch_add(1, Ordering::Relaxed),
            chain: chain.to_owned(),
            inner,
        });
        self.outbound.insert(
            chain.to_owned(),
            OutboundEntry {
                factory: Arc::clone(&factory),
                refs: 1,
            },
        );
        info!(chain, "outbound chain started for virtual connections");
        Ok(factory)
    }

    /// 已启用且逐个通道满足定义的出站链。
    fn matching_outbound_chain(&self, defs: &[OutboundChannelDef]) -> Option<String> {
        self.chains
            .values()
            .map(|entry| &entry.config)
            .filter(|config| config.flow() == FlowType::Outbound && config.is_enabled())
            .find(|config| {
                config.channels().len() == defs.len()
                    && config.channels().iter().zip(defs).all(|(channel, def)| {
                        self.channels
                            .get(channel)
                            .is_some_and(|channel| def.is_satisfied_by(channel))
                    })
            })
            .map(|config| config.name().to_owned())
    }

    /// 未被任何链或通道占用的出站链名。
    fn unused_outbound_name(&mut self, endpoint: &str, width: usize) -> String {
        loop {
            let chain = format!("{endpoint}-outbound-{}", self.next_outbound_serial());
            let taken = self.chains.contains_key(&chain)
                || (0..width).any(|index| self.channels.contains_key(&format!("{chain}-{index}")));
            if !taken {
                return chain;
            }
        }
    }

    /// 按端点的出站定义登记通道与出站链；任一步失败都撤回已登记的通道。
    fn create_outbound_chain(
        &mut self,
        endpoint: &CfEndPoint,
        policy: &dyn ChainAdmissionPolicy,
    ) -> Result<ChainConfig> {
        let defs = endpoint.outbound_channel_defs();
        if defs.is_empty() {
            return Err(FrameworkError::InvalidArgument {
                operation: "create_outbound_chain".to_owned(),
                reason: format!("endpoint `{}` has no outbound channel definitions", endpoint.name()),
            });
        }
        let chain = self.unused_outbound_name(endpoint.name(), defs.len());
        let mut channels = Vec::with_capacity(defs.len());
        let result = self.register_outbound(&chain, defs, &mut channels, policy);
        if result.is_err() {
            for channel in &channels {
                self.channels.remove(channel);
            }
        }
        result
    }

    fn register_outbound(
        &mut self,
        chain: &str,
        defs: &[OutboundChannelDef],
        channels: &mut Vec<String>,
        policy: &dyn ChainAdmissionPolicy,
    ) -> Result<ChainConfig> {
        for (index, def) in defs.iter().enumerate() {
            let name = format!("{chain}-{index}");
            let config = ChannelConfig::new(
                &name,
                def.factory_type(),
                def.properties().clone(),
                DEFAULT_DISC_WEIGHT,
            )?;
            self.insert_channel(config)?;
            channels.push(name);
        }
        self.add_chain(chain, FlowType::Outbound, channels.clone(), policy)?
            .ok_or_else(|| FrameworkError::Chain {
                chain: chain.to_owned(),
                reason: "outbound chain rejected by admission policy".into(),
            })
    }
}

impl ChannelFramework {
    /// 获取出站链的虚拟连接工厂。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 未知链或入站链返回 [`FrameworkError::InvalidChainName`]；
    ///   - 首次获取时初始化并启动链，失败时尽力拆除并返回原始错误；
    ///   - 之后的获取返回同一实例，引用计数加一；
    /// - **风险 (Trade-offs)**：每次获取都必须配对一次 [`OutboundVcFactory::destroy`]，
    ///   否则链会一直运行。
    pub fn get_outbound_vc_factory(&self, chain: &str) -> Result<Arc<OutboundVcFactory>> {
        let weak = Arc::downgrade(&self.inner);
        let ids = Arc::clone(&self.inner.vc_ids);
        self.inner
            .transact(|state, events| state.acquire_outbound(chain, weak, &ids, events))
    }

    /// 依据端点描述新建一条能连回该端点的出站链。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 端点没有出站定义时返回 [`FrameworkError::InvalidArgument`]；
    ///   - 工厂类型未注册或定义不连贯时返回相应错误，准入策略拒绝时返回
    ///     [`FrameworkError::Chain`]，两种情况下注册表均保持不变；
    /// - **执行 (How)**：链名为 `<端点名>-outbound-<序号>`，第 `i` 个通道名为 `<链名>-<i>`；
    ///   新链只登记定义，不会启动。
    pub fn create_outbound_chain(&self, endpoint: &CfEndPoint) -> Result<ChainConfig> {
        let policy = Arc::clone(&self.inner.policy);
        self.inner
            .state
            .lock()
            .create_outbound_chain(endpoint, policy.as_ref())
    }

    /// 获取能连回端点的出站虚拟连接工厂。
    ///
    /// 已配置、已启用且每个通道都满足端点出站定义的出站链会被复用；否则先以
    /// [`ChannelFramework::create_outbound_chain`] 新建。新建的链在启动失败后保留定义。
    pub fn get_outbound_vc_factory_for(
        &self,
        endpoint: &CfEndPoint,
    ) -> Result<Arc<OutboundVcFactory>> {
        let weak = Arc::downgrade(&self.inner);
        let ids = Arc::clone(&self.inner.vc_ids);
        let policy = Arc::clone(&self.inner.policy);
        self.inner.transact(|state, events| {
            let chain = match state.matching_outbound_chain(endpoint.outbound_channel_defs()) {
                Some(chain) => {
                    debug!(endpoint = endpoint.name(), chain = %chain, "reusing outbound chain");
                    chain
                }
                None => state
                    .create_outbound_chain(endpoint, policy.as_ref())?
                    .name()
                    .to_owned(),
            };
            state.acquire_outbound(&chain, weak, &ids, events)
        })
    }
}
