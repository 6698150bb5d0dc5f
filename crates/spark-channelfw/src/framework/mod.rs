//! # 通道框架
//!
//! ## 核心意图（Why）
//! - 以一个显式构造、按句柄传递的 [`ChannelFramework`] 承载全部注册表与运行表，
//!   取代隐藏的全局单例；
//! - 所有变更操作在同一把粗粒度锁内完成，从而保证引用一致性：读操作不会看到引用了
//!   正在被移除的通道的链，引用计数与生命周期迁移在同一临界区内更新。
//!
//! ## 行为契约（What）
//! - 配置注册表操作见 `config` 子模块，生命周期见 `lifecycle`，链组与监听器见 `groups`，
//!   出站虚拟连接见 `outbound`；
//! - 监听器回调在释放锁之后派发；静默完成由 [`TimerService`] 在独立执行上下文中触发。
//!
//! ## 风险提示（Trade-offs）
//! - 通道钩子在锁内执行，挂起的钩子会阻塞所有调用方；钩子不设超时。

mod config;
mod groups;
mod lifecycle;
mod outbound;
mod query;
mod state;

use std::fmt;
use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

pub use config::ChainFilter;
pub use outbound::OutboundVcFactory;
pub(crate) use outbound::OutboundLease;

use self::state::FrameworkState;
use crate::connection::InboundVcFactory;
use crate::endpoint::EndpointRegistry;
use crate::error::{FrameworkError, Result};
use crate::listener::EventQueue;
use crate::policy::{AdmitAll, ChainAdmissionPolicy};
use crate::settings::FrameworkSettings;
use crate::time::{TimerHandle, TimerService, TokioTimer};

pub(crate) struct Inner {
    state: Mutex<FrameworkState>,
    timer: Arc<dyn TimerService>,
    policy: Arc<dyn ChainAdmissionPolicy>,
    endpoints: Arc<EndpointRegistry>,
    vc_ids: Arc<AtomicU64>,
}

impl Inner {
    /// 在锁内执行变更并收集事件，释放锁后派发。
    fn transact<T>(&self, op: impl FnOnce(&mut FrameworkState, &mut EventQueue) -> T) -> T {
        let mut events = EventQueue::default();
        let result = {
            let mut state = self.state.lock();
            op(&mut state, &mut events)
        };
        events.dispatch();
        result
    }
}

/// 静默定时器的调度入口，任务仅持有框架的弱引用。
pub(crate) struct Quiescer {
    inner: Weak<Inner>,
    timer: Arc<dyn TimerService>,
}

impl Quiescer {
    pub(crate) fn schedule(
        &self,
        chain: &str,
        generation: u64,
        delay: Duration,
    ) -> io::Result<TimerHandle> {
        let inner = Weak::clone(&self.inner);
        let chain = chain.to_owned();
        self.timer.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.quiesce_expired(&chain, generation);
                }
            }),
        )
    }
}

/// 通道框架句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：承载通道/链/链组注册表、生命周期状态机、甄别流程装配与出站连接引用计数；
/// - **契约 (What)**：句柄可廉价克隆，所有克隆共享同一份状态；线程安全；
/// - **执行 (How)**：内部为 `Arc<Inner>`，定时任务与出站工厂只持有 `Weak`，
///   最后一个句柄释放后它们自动失效。
#[derive(Clone)]
pub struct ChannelFramework {
    inner: Arc<Inner>,
}

impl ChannelFramework {
    /// 以默认设置、默认 Tokio 定时器与放行全部链的准入策略创建框架。
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// 创建构建器。
    pub fn builder() -> ChannelFrameworkBuilder {
        ChannelFrameworkBuilder::default()
    }

    /// 端点注册表。
    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.inner.endpoints
    }

    /// 当前框架设置。
    pub fn settings(&self) -> FrameworkSettings {
        self.inner.state.lock().settings.clone()
    }

    /// 替换框架设置。
    pub fn update_settings(&self, settings: FrameworkSettings) {
        self.inner.state.lock().settings = settings;
    }

    /// 入站虚拟连接工厂。
    pub fn get_inbound_vc_factory(&self) -> InboundVcFactory {
        InboundVcFactory::new(Arc::clone(&self.inner.vc_ids))
    }

    /// 停止并移除所有链、链组、通道与工厂条目，汇总过程中的次级错误。
    ///
    /// 已注册的工厂类型保留，框架可以继续使用。
    pub fn clear(&self) -> Result<()> {
        let errors = self.inner.transact(|state, events| state.clear(events));
        if errors.is_empty() {
            info!("channel framework cleared");
            Ok(())
        } else {
            warn!(count = errors.len(), "channel framework cleared with errors");
            Err(FrameworkError::Teardown(errors))
        }
    }

    /// 清空框架并关闭静默定时服务。
    pub fn destroy(&self) -> Result<()> {
        let result = self.clear();
        self.inner.timer.shutdown();
        result
    }

    pub(crate) fn quiescer(&self) -> Quiescer {
        Quiescer {
            inner: Arc::downgrade(&self.inner),
            timer: Arc::clone(&self.inner.timer),
        }
    }
}

impl Default for ChannelFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChannelFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChannelFramework")
            .field("channels", &state.channels.len())
            .field("chains", &state.chains.len())
            .field("groups", &state.groups.len())
            .field("running_chains", &state.running_chains.len())
            .field("running_channels", &state.running_channels.len())
            .finish()
    }
}

/// [`ChannelFramework`] 构建器。
#[derive(Default)]
pub struct ChannelFrameworkBuilder {
    timer: Option<Arc<dyn TimerService>>,
    policy: Option<Arc<dyn ChainAdmissionPolicy>>,
    endpoints: Option<Arc<EndpointRegistry>>,
    settings: FrameworkSettings,
}

impl ChannelFrameworkBuilder {
    /// 指定静默定时服务。
    pub fn timer(mut self, timer: Arc<dyn TimerService>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// 指定链准入策略。
    pub fn admission_policy(mut self, policy: Arc<dyn ChainAdmissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// 共享外部的端点注册表。
    pub fn endpoints(mut self, endpoints: Arc<EndpointRegistry>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// 指定框架设置。
    pub fn settings(mut self, settings: FrameworkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 构建框架。
    pub fn build(self) -> ChannelFramework {
        let timer = self
            .timer
            .unwrap_or_else(|| Arc::new(TokioTimer::new()) as Arc<dyn TimerService>);
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(AdmitAll) as Arc<dyn ChainAdmissionPolicy>);
        ChannelFramework {
            inner: Arc::new(Inner {
                state: Mutex::new(FrameworkState::new(self.settings)),
                timer,
                policy,
                endpoints: self.endpoints.unwrap_or_default(),
                vc_ids: Arc::new(AtomicU64::new(1)),
            }),
        }
    }
}
