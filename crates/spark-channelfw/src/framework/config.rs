//! 配置注册表操作：工厂类型、通道与链的增删改查。
//!
//! 所有校验在任何修改之前完成，失败时注册表保持不变。

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ChannelFramework;
use super::state::{ChainEntry, FrameworkState};
use crate::error::{FrameworkError, Result};
use crate::factory::{
    ChannelFactoryData, FactoryConstructor, FactoryDescriptor, FactoryRecord, FactoryType,
};
use crate::listener::{ALL_CHAINS, ChainEvent, EventQueue, ListenerSet};
use crate::policy::ChainAdmissionPolicy;
use crate::registry::{ChainConfig, ChannelConfig, check_coherency};
use crate::types::{DEFAULT_DISC_WEIGHT, FlowType, PropertyBag};

/// 链查询过滤条件。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainFilter<'a> {
    /// 不过滤。
    All,
    /// 包含指定通道的链。
    Channel(&'a str),
    /// 包含指定工厂类型通道的链。
    FactoryType(&'a str),
}

impl FrameworkState {
    pub(crate) fn factory_type(&self, factory_type: &str) -> Result<&FactoryType> {
        if factory_type.is_empty() {
            return Err(FrameworkError::InvalidFactory {
                factory_type: factory_type.to_owned(),
                reason: "factory type is empty".into(),
            });
        }
        self.factory_types
            .get(factory_type)
            .ok_or_else(|| FrameworkError::InvalidFactory {
                factory_type: factory_type.to_owned(),
                reason: "factory type is not registered".into(),
            })
    }

    pub(crate) fn channel_config(&self, name: &str) -> Result<&ChannelConfig> {
        if name.is_empty() {
            return Err(FrameworkError::invalid_channel(name, "channel name is empty"));
        }
        self.channels
            .get(name)
            .ok_or_else(|| FrameworkError::invalid_channel(name, "channel not found"))
    }

    /// 校验链定义并返回按管线顺序排列的工厂描述。
    fn validate_chain(
        &self,
        name: &str,
        flow: FlowType,
        channels: &[String],
    ) -> Result<Vec<FactoryDescriptor>> {
        if channels.is_empty() {
            return Err(FrameworkError::invalid_channel(
                "",
                format!("chain `{name}` has no channels"),
            ));
        }
        let mut descriptors = Vec::with_capacity(channels.len());
        for channel in channels {
            let config = self.channel_config(channel)?;
            let ty = self.factory_type(config.factory_type())?;
            descriptors.push(ty.descriptor.clone());
        }
        let refs: Vec<&FactoryDescriptor> = descriptors.iter().collect();
        check_coherency(name, flow, channels, &refs)?;
        Ok(descriptors)
    }

    pub(crate) fn add_chain(
        &mut self,
        name: &str,
        flow: FlowType,
        channels: Vec<String>,
        policy: &dyn ChainAdmissionPolicy,
    ) -> Result<Option<ChainConfig>> {
        if name.is_empty() || name == ALL_CHAINS {
            return Err(FrameworkError::invalid_chain(name, "reserved or empty chain name"));
        }
        if self.chains.contains_key(name) {
            return Err(FrameworkError::DuplicateChainName {
                name: name.to_owned(),
            });
        }
        let descriptors = self.validate_chain(name, flow, &channels)?;
        let refs: Vec<&FactoryDescriptor> = descriptors.iter().collect();
        if !policy.admit(name, flow, &channels, &refs) {
            info!(chain = name, "chain rejected by admission policy");
            return Ok(None);
        }

        let config = ChainConfig::new(name, flow, channels);
        let mut listeners = ListenerSet::default();
        for global in self.global_listeners.listeners() {
            listeners.attach(&global);
        }
        self.chains.insert(
            name.to_owned(),
            ChainEntry {
                config: config.clone(),
                listeners,
                direct: ListenerSet::default(),
            },
        );
        info!(chain = name, %flow, channels = ?config.channels(), "chain added");
        Ok(Some(config))
    }

    pub(crate) fn remove_chain(&mut self, name: &str) -> Result<ChainConfig> {
        let entry = self.chain_entry(name)?;
        let state = self.chain_state(name);
        if state != crate::types::RuntimeState::Uninitialized {
            return Err(FrameworkError::ChainInUse {
                name: name.to_owned(),
                state,
            });
        }
        let config = entry.config.clone();
        for group in self.groups.values_mut() {
            group.config.remove(name);
        }
        self.chains.remove(name);
        info!(chain = name, "chain removed");
        Ok(config)
    }

    pub(crate) fn update_chain(
        &mut self,
        name: &str,
        channels: Vec<String>,
        events: &mut EventQueue,
    ) -> Result<ChainConfig> {
        let flow = self.chain_entry(name)?.config.flow();
        let state = self.chain_state(name);
        if state != crate::types::RuntimeState::Uninitialized {
            return Err(FrameworkError::ChainRunning {
                name: name.to_owned(),
                state,
            });
        }
        self.validate_chain(name, flow, &channels)?;
        let Some(entry) = self.chains.get_mut(name) else {
            return Err(FrameworkError::invalid_chain(name, "chain not found"));
        };
        entry.config.set_channels(channels);
        let config = entry.config.clone();
        info!(chain = name, channels = ?config.channels(), "chain updated");
        self.notify(name, ChainEvent::Updated, events);
        Ok(config)
    }

    /// 登记通道定义，并惰性创建工厂条目（尚未实例化工厂单例）。
    pub(crate) fn insert_channel(&mut self, config: ChannelConfig) -> Result<()> {
        if self.channels.contains_key(config.name()) {
            return Err(FrameworkError::DuplicateChannelName {
                name: config.name().to_owned(),
            });
        }
        self.factory_type(config.factory_type())?;
        self.factories
            .entry(config.factory_type().to_owned())
            .or_insert_with(FactoryRecord::default);
        info!(
            channel = config.name(),
            factory = config.factory_type(),
            weight = config.weight(),
            "channel added"
        );
        self.channels.insert(config.name().to_owned(), config);
        Ok(())
    }

    pub(crate) fn remove_channel(&mut self, name: &str) -> Result<ChannelConfig> {
        let config = self.channel_config(name)?.clone();
        let in_use = self
            .running_chains
            .values()
            .any(|running| running.config.contains_channel(name));
        if in_use {
            return Err(FrameworkError::ChannelInUse {
                name: name.to_owned(),
            });
        }
        let stale: Vec<String> = self
            .chains
            .values()
            .filter(|entry| entry.config.contains_channel(name))
            .map(|entry| entry.config.name().to_owned())
            .collect();
        for chain in stale {
            self.remove_chain(&chain)?;
        }
        self.channels.remove(name);
        info!(channel = name, "channel removed");
        Ok(config)
    }

    /// 写入新的通道快照，并推送给所有运行中的实例。
    fn replace_channel(&mut self, config: ChannelConfig) {
        for running in self.running_channels.values_mut() {
            if running.config.name() == config.name() {
                running.channel.update(&config);
                running.config = config.clone();
            }
        }
        self.channels.insert(config.name().to_owned(), config);
    }

    /// 停止、销毁并移除所有用到某工厂类型的链，随后移除该类型的通道与工厂条目。
    fn purge_factory_type(&mut self, factory_type: &str, events: &mut EventQueue) -> Vec<String> {
        let mut errors = Vec::new();
        let channels: Vec<String> = self
            .channels
            .values()
            .filter(|config| config.factory_type() == factory_type)
            .map(|config| config.name().to_owned())
            .collect();
        let chains: Vec<String> = self
            .chains
            .values()
            .filter(|entry| {
                channels
                    .iter()
                    .any(|channel| entry.config.contains_channel(channel))
            })
            .map(|entry| entry.config.name().to_owned())
            .collect();

        for chain in &chains {
            if let Err(error) = self.teardown_chain(chain, events) {
                errors.push(error.to_string());
            }
        }
        for channel in &channels {
            if let Err(error) = self.remove_channel(channel) {
                errors.push(error.to_string());
            }
        }
        if let Some(mut record) = self.factories.remove(factory_type) {
            record.discard_if_idle(factory_type);
        }
        errors
    }

    /// 停止（超时为零）、销毁并从注册表移除一条链，无论其流向。
    pub(crate) fn teardown_chain(&mut self, name: &str, events: &mut EventQueue) -> Result<()> {
        if self.chain_state(name).is_running() {
            self.finish_stop(name, events);
        }
        self.outbound.remove(name);
        self.destroy_chain(name, events)?;
        self.remove_chain(name)?;
        Ok(())
    }

    /// 拆除全部运行期与配置状态，返回次级错误。
    pub(crate) fn clear(&mut self, events: &mut EventQueue) -> Vec<String> {
        let mut errors = Vec::new();
        let chains: Vec<String> = self.chains.keys().cloned().collect();
        for chain in chains {
            if let Err(error) = self.teardown_chain(&chain, events) {
                warn!(chain = %chain, %error, "chain teardown failed");
                errors.push(error.to_string());
            }
        }
        self.groups.clear();
        self.global_listeners = ListenerSet::default();
        let channels: Vec<String> = self.channels.keys().cloned().collect();
        for channel in channels {
            if let Err(error) = self.remove_channel(&channel) {
                warn!(channel = %channel, %error, "channel removal failed");
                errors.push(error.to_string());
            }
        }
        for (factory_type, mut record) in std::mem::take(&mut self.factories) {
            if record.ref_count() > 0 {
                errors.push(format!(
                    "factory `{factory_type}` still referenced by {} channels",
                    record.ref_count()
                ));
            }
            record.discard_if_idle(&factory_type);
        }
        errors
    }
}

impl ChannelFramework {
    /// 注册通道工厂类型；同名类型被替换。
    pub fn register_factory(&self, factory_type: &str, constructor: FactoryConstructor) -> Result<()> {
        if factory_type.is_empty() {
            return Err(FrameworkError::InvalidFactory {
                factory_type: String::new(),
                reason: "factory type is empty".into(),
            });
        }
        let ty = FactoryType::new(constructor);
        let mut state = self.inner.state.lock();
        if state
            .factory_types
            .insert(factory_type.to_owned(), ty)
            .is_some()
        {
            debug!(factory = factory_type, "channel factory type replaced");
        } else {
            debug!(factory = factory_type, "channel factory type registered");
        }
        Ok(())
    }

    /// 注销工厂类型：停止、销毁并移除所有使用它的链与通道。
    pub fn deregister_factory(&self, factory_type: &str) -> Result<()> {
        let errors = self.inner.transact(|state, events| {
            state.factory_type(factory_type)?;
            let errors = state.purge_factory_type(factory_type, events);
            state.factory_types.remove(factory_type);
            info!(factory = factory_type, "channel factory type deregistered");
            Ok::<_, FrameworkError>(errors)
        })?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FrameworkError::Teardown(errors))
        }
    }

    /// 查询已注册工厂类型的接口声明。
    pub fn lookup_factory(&self, factory_type: &str) -> Option<FactoryDescriptor> {
        let state = self.inner.state.lock();
        state
            .factory_types
            .get(factory_type)
            .map(|ty| ty.descriptor.clone())
    }

    /// 工厂条目快照；尚未被任何通道引用时返回 `None`。
    pub fn get_channel_factory(&self, factory_type: &str) -> Option<ChannelFactoryData> {
        let state = self.inner.state.lock();
        state
            .factories
            .get(factory_type)
            .map(|record| record.snapshot(factory_type))
    }

    /// 更新单个工厂级属性。
    pub fn update_channel_factory_property(
        &self,
        factory_type: &str,
        key: &str,
        value: &str,
    ) -> Result<ChannelFactoryData> {
        if key.is_empty() {
            return Err(FrameworkError::InvalidArgument {
                operation: "update_channel_factory_property".into(),
                reason: "property key is empty".into(),
            });
        }
        let mut state = self.inner.state.lock();
        state.factory_type(factory_type)?;
        let record = state.factories.entry(factory_type.to_owned()).or_default();
        let mut properties = record.properties().clone();
        properties.insert(key.to_owned(), value.to_owned());
        record.set_properties(properties);
        Ok(record.snapshot(factory_type))
    }

    /// 整体替换工厂级属性。
    pub fn update_all_channel_factory_properties(
        &self,
        factory_type: &str,
        properties: PropertyBag,
    ) -> Result<ChannelFactoryData> {
        let mut state = self.inner.state.lock();
        state.factory_type(factory_type)?;
        let record = state.factories.entry(factory_type.to_owned()).or_default();
        record.set_properties(properties);
        Ok(record.snapshot(factory_type))
    }

    /// 新增通道。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：名称为空或重复、工厂类型为空或未注册、权重为负时失败；
    ///   `weight` 为 `None` 时使用 [`DEFAULT_DISC_WEIGHT`]；
    /// - **执行 (How)**：成功后惰性创建工厂条目（尚未实例化工厂单例）。
    pub fn add_channel(
        &self,
        name: &str,
        factory_type: &str,
        properties: PropertyBag,
        weight: Option<i32>,
    ) -> Result<ChannelConfig> {
        let config = ChannelConfig::new(
            name,
            factory_type,
            properties,
            weight.unwrap_or(DEFAULT_DISC_WEIGHT),
        )?;
        self.inner.state.lock().insert_channel(config.clone())?;
        Ok(config)
    }

    /// 移除通道，并级联移除所有引用它的链定义。
    ///
    /// 仍有运行链引用该通道时返回 [`FrameworkError::ChannelInUse`]。
    pub fn remove_channel(&self, name: &str) -> Result<ChannelConfig> {
        self.inner.state.lock().remove_channel(name)
    }

    /// 更新甄别权重，运行中的实例收到新快照，甄别流程随之重排。
    pub fn update_channel_weight(&self, name: &str, weight: i32) -> Result<ChannelConfig> {
        let mut state = self.inner.state.lock();
        let next = state.channel_config(name)?.with_weight(weight)?;
        state.replace_channel(next.clone());
        state.reweigh_discriminator(name, weight)?;
        Ok(next)
    }

    /// 更新单个通道属性。
    pub fn update_channel_property(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<ChannelConfig> {
        if key.is_empty() {
            return Err(FrameworkError::InvalidArgument {
                operation: "update_channel_property".into(),
                reason: "property key is empty".into(),
            });
        }
        let mut state = self.inner.state.lock();
        let next = state.channel_config(name)?.with_property(key, value);
        state.replace_channel(next.clone());
        Ok(next)
    }

    /// 整体替换通道属性。
    pub fn update_all_channel_properties(
        &self,
        name: &str,
        properties: PropertyBag,
    ) -> Result<ChannelConfig> {
        let mut state = self.inner.state.lock();
        let next = state.channel_config(name)?.with_properties(properties);
        state.replace_channel(next.clone());
        Ok(next)
    }

    /// 通道配置快照。
    pub fn get_channel(&self, name: &str) -> Option<ChannelConfig> {
        self.inner.state.lock().channels.get(name).cloned()
    }

    /// 全部通道配置。
    pub fn get_all_channels(&self) -> Vec<ChannelConfig> {
        self.inner.state.lock().channels.values().cloned().collect()
    }

    /// 至少有一个运行实例的通道配置。
    pub fn get_running_channels(&self) -> Vec<ChannelConfig> {
        let state = self.inner.state.lock();
        let mut configs: Vec<ChannelConfig> = Vec::new();
        for running in state.running_channels.values() {
            if !configs.iter().any(|config| config.name() == running.config.name()) {
                configs.push(running.config.clone());
            }
        }
        configs
    }

    /// 新增链。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 通道列表为空或引用未知通道返回 [`FrameworkError::InvalidChannelName`]；
    ///   - 重名返回 [`FrameworkError::DuplicateChainName`]，保留名 [`ALL_CHAINS`] 不可用；
    ///   - 相邻通道接口不匹配返回 [`FrameworkError::IncoherentChain`]；
    ///   - 准入策略拒绝时返回 `Ok(None)`，注册表不变；
    /// - **执行 (How)**：新链自动挂上全部全局监听器。
    pub fn add_chain(
        &self,
        name: &str,
        flow: FlowType,
        channels: &[&str],
    ) -> Result<Option<ChainConfig>> {
        let channels = channels.iter().map(|channel| (*channel).to_owned()).collect();
        let policy = Arc::clone(&self.inner.policy);
        self.inner
            .state
            .lock()
            .add_chain(name, flow, channels, policy.as_ref())
    }

    /// 移除链并将其逐出所有链组；链在运行表中时返回 [`FrameworkError::ChainInUse`]。
    pub fn remove_chain(&self, name: &str) -> Result<ChainConfig> {
        self.inner.state.lock().remove_chain(name)
    }

    /// 替换链的通道列表，保留链组成员关系与监听器；链处于活动状态时返回
    /// [`FrameworkError::ChainRunning`]。
    pub fn update_chain(&self, name: &str, channels: &[&str]) -> Result<ChainConfig> {
        let channels = channels.iter().map(|channel| (*channel).to_owned()).collect();
        self.inner
            .transact(|state, events| state.update_chain(name, channels, events))
    }

    /// 启用或停用链；停用的链被启动操作跳过。
    pub fn set_chain_enabled(&self, name: &str, enabled: bool) -> Result<ChainConfig> {
        let mut state = self.inner.state.lock();
        state.chain_entry(name)?;
        let Some(entry) = state.chains.get_mut(name) else {
            return Err(FrameworkError::invalid_chain(name, "chain not found"));
        };
        entry.config.set_enabled(enabled);
        debug!(chain = name, enabled, "chain enable flag updated");
        Ok(entry.config.clone())
    }

    /// 链配置快照。
    pub fn get_chain(&self, name: &str) -> Option<ChainConfig> {
        self.inner
            .state
            .lock()
            .chains
            .get(name)
            .map(|entry| entry.config.clone())
    }

    /// 按过滤条件列出全部链。
    pub fn get_all_chains(&self, filter: ChainFilter<'_>) -> Result<Vec<ChainConfig>> {
        let state = self.inner.state.lock();
        state.filter_chains(filter, |_| true)
    }

    /// 按过滤条件列出运行表中的链。
    pub fn get_running_chains(&self, filter: ChainFilter<'_>) -> Result<Vec<ChainConfig>> {
        let state = self.inner.state.lock();
        state.filter_chains(filter, |name| state.running_chains.contains_key(name))
    }
}

impl FrameworkState {
    fn filter_chains(
        &self,
        filter: ChainFilter<'_>,
        include: impl Fn(&str) -> bool,
    ) -> Result<Vec<ChainConfig>> {
        let matches: Box<dyn Fn(&ChainConfig) -> bool + '_> = match filter {
            ChainFilter::All => Box::new(|_| true),
            ChainFilter::Channel(channel) => {
                self.channel_config(channel)?;
                Box::new(move |config| config.contains_channel(channel))
            }
            ChainFilter::FactoryType(factory_type) => {
                self.factory_type(factory_type)?;
                Box::new(move |config| {
                    config.channels().iter().any(|channel| {
                        self.channels
                            .get(channel)
                            .is_some_and(|config| config.factory_type() == factory_type)
                    })
                })
            }
        };
        Ok(self
            .chains
            .values()
            .map(|entry| &entry.config)
            .filter(|config| include(config.name()) && matches(config))
            .cloned()
            .collect())
    }
}
