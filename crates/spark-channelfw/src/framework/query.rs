//! 只读查询：运行态、计数器、端点与甄别流程。

use std::sync::Arc;

use super::ChannelFramework;
use super::state::{FrameworkState, runtime_key};
use crate::discrimination::{DiscriminationHandle, DiscriminationProcess};
use crate::endpoint::{CfEndPoint, Endpoint, OutboundChannelDef};
use crate::error::{FrameworkError, Result};
use crate::registry::{ChainConfig, ChannelConfig};
use crate::types::{
    FlowType, PROPERTY_ENDPOINT, PROPERTY_HOST_NAME, PROPERTY_LISTENING_PORT, PROPERTY_PORT,
    PROPERTY_VIRTUAL_HOSTS, PropertyBag, RuntimeState,
};

const WILDCARD_HOST: &str = "*";

fn chain_error(chain: &str, reason: impl Into<String>) -> FrameworkError {
    FrameworkError::Chain {
        chain: chain.to_owned(),
        reason: reason.into(),
    }
}

fn parse_port(chain: &str, text: &str) -> Result<u16> {
    text.trim()
        .parse::<u16>()
        .map_err(|_| chain_error(chain, format!("invalid port `{text}`")))
}

impl FrameworkState {
    fn inbound_chain(&self, chain: &str) -> Result<&ChainConfig> {
        let config = &self.chain_entry(chain)?.config;
        if config.flow() != FlowType::Inbound {
            return Err(FrameworkError::invalid_chain(chain, "chain is not inbound"));
        }
        Ok(config)
    }

    /// 入站链设备侧通道的当前配置；运行中的实例优先，以便读到回写的监听端口。
    fn device_config(&self, chain: &str) -> Result<ChannelConfig> {
        let config = self.inbound_chain(chain)?;
        let device = config
            .device_channel()
            .ok_or_else(|| chain_error(chain, "chain has no channels"))?;
        if let Some(running) = self.running_channels.get(device) {
            return Ok(running.config.clone());
        }
        self.channels
            .get(device)
            .cloned()
            .ok_or_else(|| FrameworkError::invalid_channel(device, "channel not found"))
    }

    fn require_running_inbound(&self, chain: &str) -> Result<()> {
        self.inbound_chain(chain)?;
        if !self.chain_state(chain).is_running() {
            return Err(chain_error(chain, "chain is not running"));
        }
        Ok(())
    }
}

fn configured_port(chain: &str, config: &ChannelConfig) -> Result<u16> {
    let text = config
        .property(PROPERTY_LISTENING_PORT)
        .or_else(|| config.property(PROPERTY_PORT))
        .ok_or_else(|| chain_error(chain, "device channel has no port"))?;
    parse_port(chain, text)
}

/// 出站设备侧通道的属性：去掉监听相关的键，写入解析后的目标地址。
fn connect_properties(device: &ChannelConfig, address: &Endpoint) -> PropertyBag {
    let mut properties = device.properties().clone();
    for key in [PROPERTY_ENDPOINT, PROPERTY_LISTENING_PORT, PROPERTY_VIRTUAL_HOSTS] {
        properties.remove(key);
    }
    properties.insert(PROPERTY_HOST_NAME.to_owned(), address.host.clone());
    properties.insert(PROPERTY_PORT.to_owned(), address.port.to_string());
    properties
}

impl ChannelFramework {
    /// 链的生命周期状态；不在运行表中的链为 `UNINITIALIZED`。
    pub fn get_chain_state(&self, chain: &str) -> Result<RuntimeState> {
        let state = self.inner.state.lock();
        state.chain_entry(chain)?;
        Ok(state.chain_state(chain))
    }

    /// 通道在给定链中的运行状态。
    ///
    /// 共享通道的状态是所有引用它的链所达到的最高状态。
    pub fn get_channel_state(&self, channel: &str, chain: &str) -> Result<RuntimeState> {
        let state = self.inner.state.lock();
        let config = &state.chain_entry(chain)?.config;
        if !config.contains_channel(channel) {
            return Err(FrameworkError::invalid_channel(
                channel,
                format!("channel is not part of chain `{chain}`"),
            ));
        }
        let key = runtime_key(config.flow(), channel, chain);
        Ok(state
            .running_channels
            .get(&key)
            .filter(|running| running.chains.iter().any(|name| name == chain))
            .map_or(RuntimeState::Uninitialized, |running| running.state))
    }

    /// 链是否处于 `STARTED`。
    pub fn is_chain_running(&self, chain: &str) -> bool {
        self.inner.state.lock().chain_state(chain) == RuntimeState::Started
    }

    /// 已配置的通道数。
    pub fn num_channels(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    /// 已配置的链数。
    pub fn num_chains(&self) -> usize {
        self.inner.state.lock().chains.len()
    }

    /// 运行表中的链数。
    pub fn num_running_chains(&self) -> usize {
        self.inner.state.lock().running_chains.len()
    }

    /// 运行表中的通道实例数。
    pub fn num_running_channels(&self) -> usize {
        self.inner.state.lock().running_channels.len()
    }

    /// 工厂条目数。
    pub fn num_channel_factories(&self) -> usize {
        self.inner.state.lock().factories.len()
    }

    /// 链组数。
    pub fn num_chain_groups(&self) -> usize {
        self.inner.state.lock().groups.len()
    }

    /// 包含指定链的链组数。
    pub fn num_groups_using_chain(&self, chain: &str) -> usize {
        self.inner
            .state
            .lock()
            .groups
            .values()
            .filter(|entry| entry.config.contains(chain))
            .count()
    }

    /// 存活的出站虚拟连接工厂数。
    pub fn num_outbound_vc_factories(&self) -> usize {
        self.inner.state.lock().outbound.len()
    }

    /// 包含指定通道且处于 `STARTED` 的链数。
    pub fn num_started_chains_using_channel(&self, channel: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .running_chains
            .values()
            .filter(|running| {
                running.state == RuntimeState::Started && running.config.contains_channel(channel)
            })
            .count()
    }

    /// 入站链的端点描述。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 地址取自设备侧通道：`endpoint=<name>` 引用优先，其次为 `hostname` 与
    ///     `listeningPort`/`port` 属性，主机缺省为通配地址 `*`；
    ///   - 链中任一通道的工厂声明安全传输时，`is_ssl_enabled` 为真；
    ///   - 虚拟主机取自设备侧通道的 `virtualHosts` 属性；出站定义按链的逆序生成，
    ///     设备侧定义以解析后的地址替换监听相关属性；
    ///   - 出站链返回 [`FrameworkError::InvalidChainName`]，缺少端口返回
    ///     [`FrameworkError::Chain`]。
    pub fn get_end_point(&self, chain: &str) -> Result<CfEndPoint> {
        let state = self.inner.state.lock();
        let config = state.inbound_chain(chain)?.clone();
        let device = state.device_config(chain)?;

        let address = match device.property(PROPERTY_ENDPOINT) {
            Some(name) => self
                .inner
                .endpoints
                .resolve(name)
                .ok_or_else(|| chain_error(chain, format!("endpoint `{name}` is not defined")))?,
            None => Endpoint::new(
                device.property(PROPERTY_HOST_NAME).unwrap_or(WILDCARD_HOST),
                configured_port(chain, &device)?,
            ),
        };

        let mut secure = false;
        let mut accessor = None;
        let mut outbound = Vec::with_capacity(config.channels().len());
        for name in config.channels().iter().rev() {
            let channel = state.channel_config(name)?;
            let descriptor = &state.factory_type(channel.factory_type())?.descriptor;
            secure |= descriptor.secure;
            accessor = accessor.or(Some(descriptor.application_interface));
            let properties = if descriptor.is_device_facing() {
                connect_properties(&device, &address)
            } else {
                channel.properties().clone()
            };
            outbound.push(OutboundChannelDef::new(channel.factory_type(), properties));
        }
        let virtual_hosts = device
            .property(PROPERTY_VIRTUAL_HOSTS)
            .map(|hosts| {
                hosts
                    .split(',')
                    .map(str::trim)
                    .filter(|host| !host.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let endpoint = CfEndPoint::new(
            chain,
            address,
            secure,
            config.flow(),
            config.channels().to_vec(),
        )
        .with_virtual_hosts(virtual_hosts)
        .with_outbound_defs(outbound);
        Ok(match accessor {
            Some(accessor) => endpoint.with_accessor(accessor),
            None => endpoint,
        })
    }

    /// 运行中入站链的监听端口。
    pub fn get_listening_port(&self, chain: &str) -> Result<u16> {
        let state = self.inner.state.lock();
        state.require_running_inbound(chain)?;
        let device = state.device_config(chain)?;
        if let Some(name) = device.property(PROPERTY_ENDPOINT)
            && let Some(endpoint) = self.inner.endpoints.resolve(name)
        {
            return Ok(endpoint.port);
        }
        configured_port(chain, &device)
    }

    /// 运行中入站链的监听主机。
    pub fn get_listening_host(&self, chain: &str) -> Result<String> {
        let state = self.inner.state.lock();
        state.require_running_inbound(chain)?;
        let device = state.device_config(chain)?;
        if let Some(name) = device.property(PROPERTY_ENDPOINT)
            && let Some(endpoint) = self.inner.endpoints.resolve(name)
        {
            return Ok(endpoint.host);
        }
        device
            .property(PROPERTY_HOST_NAME)
            .map(str::to_owned)
            .ok_or_else(|| chain_error(chain, "device channel has no host name"))
    }

    /// 运行中入站通道当前的甄别流程快照。
    pub fn discrimination_process(&self, channel: &str) -> Option<Arc<DiscriminationProcess>> {
        self.discrimination_handle(channel)
            .map(|handle| handle.load_full())
    }

    /// 运行中入站通道的甄别流程句柄，数据路径可长期持有并无锁读取。
    pub fn discrimination_handle(&self, channel: &str) -> Option<DiscriminationHandle> {
        let state = self.inner.state.lock();
        state
            .running_channels
            .get(channel)
            .and_then(|running| running.process.as_ref())
            .map(Arc::clone)
    }
}
