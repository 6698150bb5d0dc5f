//! 通道框架的测试桩集合：记录型工厂与通道、固定投票的甄别器、记录型监听器。
//!
//! # 设计定位（Why）
//! - 注册表、生命周期与甄别流程的测试都需要满足 [`ChannelFactory`]、[`Channel`]、
//!   [`Discriminator`] 与 [`ChainEventListener`] 契约，但只关心框架调用了哪些钩子、以何种顺序；
//! - 集中在一个公开模块中，单元测试与 `tests/` 下的集成测试共用同一套桩，
//!   接口演进时只需在此处同步修改。
//!
//! # 使用方式（How）
//! - [`StubFactory::transport`] 产出面向设备的传输通道，[`StubFactory::protocol`] 产出位于其上方、
//!   携带甄别器的协议通道；两者共享同一个 [`Journal`]，可通过 [`StubFactory::journal`] 读取；
//! - 协议通道的甄别器投票取自通道属性 `vote`（`yes`/`no`/`maybe`，缺省 `yes`）；
//! - [`Journal::fail`] 为指定通道的指定钩子注入若干次失败，可选择是否可重试。
//!
//! # 风险与权衡（Trade-offs）
//! - 桩通道不做任何 I/O；需要验证真实网络行为的测试应使用实际传输实现。

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::connection::VirtualConnection;
use crate::discrimination::{ConnectionLink, DiscriminationProcess, Discriminator, Vote};
use crate::error::ChannelError;
use crate::factory::{ChannelFactory, ChannelFactoryData, FactoryConstructor};
use crate::listener::{ChainEvent, ChainEventListener};
use crate::registry::{ChainConfig, ChannelConfig};
use crate::types::{FlowType, PropertyBag, TypeToken};

/// 传输层接口标记。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StubTransport;

/// 协议层接口标记。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StubProtocol;

/// 协议通道属性中指定甄别投票的键。
pub const PROPERTY_VOTE: &str = "vote";

#[derive(Default)]
struct JournalState {
    calls: Vec<(String, &'static str)>,
    failures: HashMap<(String, &'static str), (usize, bool)>,
    stop_timeouts: HashMap<String, Vec<Duration>>,
    configs: HashMap<String, ChannelConfig>,
    process_updates: HashMap<String, usize>,
    factory_inits: Vec<PropertyBag>,
    factory_updates: Vec<PropertyBag>,
    destroyed_factories: usize,
}

/// 钩子调用记录，可在多个工厂与通道之间共享。
#[derive(Clone, Default)]
pub struct Journal {
    state: Arc<Mutex<JournalState>>,
}

impl Journal {
    /// 为 `channel` 的 `hook` 注入 `times` 次失败。
    pub fn fail(&self, channel: &str, hook: &'static str, times: usize, retryable: bool) {
        self.state
            .lock()
            .failures
            .insert((channel.to_owned(), hook), (times, retryable));
    }

    /// 按发生顺序列出全部钩子调用。
    pub fn calls(&self) -> Vec<(String, &'static str)> {
        self.state.lock().calls.clone()
    }

    /// 指定通道依次收到的钩子。
    pub fn hooks_for(&self, channel: &str) -> Vec<&'static str> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, hook)| *hook)
            .collect()
    }

    /// 指定通道的指定钩子被调用的次数。
    pub fn count(&self, channel: &str, hook: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(name, called)| name == channel && *called == hook)
            .count()
    }

    /// 指定通道每次 `stop` 收到的超时。
    pub fn stop_timeouts(&self, channel: &str) -> Vec<Duration> {
        self.state
            .lock()
            .stop_timeouts
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// 指定通道最近一次通过 `update` 收到的配置。
    pub fn last_config(&self, channel: &str) -> Option<ChannelConfig> {
        self.state.lock().configs.get(channel).cloned()
    }

    /// 指定通道收到的甄别流程替换次数。
    pub fn process_updates(&self, channel: &str) -> usize {
        self.state
            .lock()
            .process_updates
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// 工厂单例每次初始化时收到的工厂级属性。
    pub fn factory_inits(&self) -> Vec<PropertyBag> {
        self.state.lock().factory_inits.clone()
    }

    /// 工厂单例收到的属性更新。
    pub fn factory_updates(&self) -> Vec<PropertyBag> {
        self.state.lock().factory_updates.clone()
    }

    /// 被销毁的工厂单例数。
    pub fn destroyed_factories(&self) -> usize {
        self.state.lock().destroyed_factories
    }

    /// 清空调用记录，保留注入的失败。
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.stop_timeouts.clear();
    }

    fn hook(&self, channel: &str, hook: &'static str) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        state.calls.push((channel.to_owned(), hook));
        let key = (channel.to_owned(), hook);
        let Some((remaining, retryable)) = state.failures.get_mut(&key) else {
            return Ok(());
        };
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        let message = format!("injected {hook} failure on `{channel}`");
        Err(if *retryable {
            ChannelError::retryable(message)
        } else {
            ChannelError::new(message)
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Layer {
    Transport,
    Protocol,
}

/// 记录型通道工厂。
#[derive(Clone)]
pub struct StubFactory {
    layer: Layer,
    secure: bool,
    journal: Journal,
}

impl StubFactory {
    /// 面向设备的传输工厂：向上暴露 [`StubTransport`]，甄别数据为 [`Bytes`]。
    pub fn transport() -> Self {
        Self {
            layer: Layer::Transport,
            secure: false,
            journal: Journal::default(),
        }
    }

    /// 协议工厂：接受 [`StubTransport`]，向上暴露 [`StubProtocol`]，通道携带甄别器。
    pub fn protocol() -> Self {
        Self {
            layer: Layer::Protocol,
            secure: false,
            journal: Journal::default(),
        }
    }

    /// 声明安全传输。
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// 与另一个桩工厂共享调用记录。
    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    /// 调用记录。
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// 注册用的构造器。
    pub fn constructor(&self) -> FactoryConstructor {
        let template = self.clone();
        Arc::new(move || Box::new(template.clone()) as Box<dyn ChannelFactory>)
    }
}

impl ChannelFactory for StubFactory {
    fn init(&mut self, data: &ChannelFactoryData) -> Result<(), ChannelError> {
        self.journal
            .state
            .lock()
            .factory_inits
            .push(data.properties().clone());
        Ok(())
    }

    fn update_properties(&mut self, properties: &PropertyBag) {
        self.journal
            .state
            .lock()
            .factory_updates
            .push(properties.clone());
    }

    fn destroy(&mut self) {
        self.journal.state.lock().destroyed_factories += 1;
    }

    fn application_interface(&self) -> TypeToken {
        match self.layer {
            Layer::Transport => TypeToken::of::<StubTransport>(),
            Layer::Protocol => TypeToken::of::<StubProtocol>(),
        }
    }

    fn device_interfaces(&self) -> Vec<TypeToken> {
        match self.layer {
            Layer::Transport => Vec::new(),
            Layer::Protocol => vec![TypeToken::of::<StubTransport>()],
        }
    }

    fn discriminatory_type(&self) -> TypeToken {
        match self.layer {
            Layer::Transport => TypeToken::of::<Bytes>(),
            Layer::Protocol => TypeToken::of::<StubProtocol>(),
        }
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn create_channel(
        &mut self,
        config: &ChannelConfig,
        flow: FlowType,
    ) -> Result<Box<dyn Channel>, ChannelError> {
        let discriminator = match (self.layer, flow) {
            (Layer::Protocol, FlowType::Inbound) => {
                let vote = match config.property(PROPERTY_VOTE) {
                    Some("no") => Vote::No,
                    Some("maybe") => Vote::Maybe,
                    _ => Vote::Yes,
                };
                Some(Arc::new(StubDiscriminator::fixed(config.name(), vote)))
            }
            _ => None,
        };
        Ok(Box::new(StubChannel {
            name: config.name().to_owned(),
            journal: self.journal.clone(),
            discriminator,
        }))
    }
}

/// 记录型通道。
pub struct StubChannel {
    name: String,
    journal: Journal,
    discriminator: Option<Arc<StubDiscriminator>>,
}

impl Channel for StubChannel {
    fn init(&mut self) -> Result<(), ChannelError> {
        self.journal.hook(&self.name, "init")
    }

    fn start(&mut self) -> Result<(), ChannelError> {
        self.journal.hook(&self.name, "start")
    }

    fn stop(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.journal
            .state
            .lock()
            .stop_timeouts
            .entry(self.name.clone())
            .or_default()
            .push(timeout);
        self.journal.hook(&self.name, "stop")
    }

    fn destroy(&mut self) -> Result<(), ChannelError> {
        self.journal.hook(&self.name, "destroy")
    }

    fn update(&mut self, config: &ChannelConfig) {
        self.journal
            .state
            .lock()
            .configs
            .insert(self.name.clone(), config.clone());
    }

    fn discriminator(&self) -> Option<Arc<dyn Discriminator>> {
        self.discriminator
            .as_ref()
            .map(|discriminator| Arc::clone(discriminator) as Arc<dyn Discriminator>)
    }

    fn discrimination_updated(&mut self, _process: Arc<DiscriminationProcess>) {
        *self
            .journal
            .state
            .lock()
            .process_updates
            .entry(self.name.clone())
            .or_default() += 1;
    }
}

/// 始终投出同一票的甄别器，消费 [`Bytes`]。
#[derive(Debug)]
pub struct StubDiscriminator {
    name: String,
    data_type: TypeToken,
    vote: Vote,
    calls: AtomicUsize,
}

impl StubDiscriminator {
    /// 构造固定投票的甄别器。
    pub fn fixed(name: &str, vote: Vote) -> Self {
        Self {
            name: name.to_owned(),
            data_type: TypeToken::of::<Bytes>(),
            vote,
            calls: AtomicUsize::new(0),
        }
    }

    /// 被询问的次数。
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Discriminator for StubDiscriminator {
    fn channel_name(&self) -> &str {
        &self.name
    }

    fn discriminatory_type(&self) -> TypeToken {
        self.data_type
    }

    fn discriminate(&self, _vc: &VirtualConnection, _data: &dyn Any) -> Vote {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vote
    }

    fn connection_link(&self, _vc: &VirtualConnection) -> Arc<dyn ConnectionLink> {
        Arc::new(StubLink {
            channel: self.name.clone(),
        })
    }
}

/// 只记录所属通道名的连接链路。
#[derive(Debug)]
pub struct StubLink {
    channel: String,
}

impl ConnectionLink for StubLink {
    fn channel_name(&self) -> &str {
        &self.channel
    }
}

/// 记录全部链事件的监听器。
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(String, ChainEvent)>>,
}

impl RecordingListener {
    /// 按派发顺序列出 `(链名, 事件)`。
    pub fn events(&self) -> Vec<(String, ChainEvent)> {
        self.events.lock().clone()
    }

    /// 指定链收到的事件。
    pub fn events_for(&self, chain: &str) -> Vec<ChainEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == chain)
            .map(|(_, event)| *event)
            .collect()
    }

    /// 指定事件出现的次数。
    pub fn count(&self, event: ChainEvent) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, recorded)| *recorded == event)
            .count()
    }

    /// 清空记录。
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, chain: &ChainConfig, event: ChainEvent) {
        self.events.lock().push((chain.name().to_owned(), event));
    }
}

impl ChainEventListener for RecordingListener {
    fn chain_initialized(&self, chain: &ChainConfig) {
        self.record(chain, ChainEvent::Initialized);
    }

    fn chain_started(&self, chain: &ChainConfig) {
        self.record(chain, ChainEvent::Started);
    }

    fn chain_quiesced(&self, chain: &ChainConfig) {
        self.record(chain, ChainEvent::Quiesced);
    }

    fn chain_stopped(&self, chain: &ChainConfig) {
        self.record(chain, ChainEvent::Stopped);
    }

    fn chain_destroyed(&self, chain: &ChainConfig) {
        self.record(chain, ChainEvent::Destroyed);
    }

    fn chain_updated(&self, chain: &ChainConfig) {
        self.record(chain, ChainEvent::Updated);
    }

    fn chain_start_failed(&self, chain: &ChainConfig, attempts_made: u32, attempts_left: i32) {
        self.record(
            chain,
            ChainEvent::StartFailed {
                attempts_made,
                attempts_left,
            },
        );
    }
}
