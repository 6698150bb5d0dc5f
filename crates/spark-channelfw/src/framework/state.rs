//! 框架锁保护的全部可变状态：配置注册表、运行表与各类引用计数。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use super::outbound::OutboundEntry;
use crate::channel::Channel;
use crate::discrimination::{DiscriminationHandle, DiscriminationProcess, Discriminator};
use crate::error::{FrameworkError, Result};
use crate::factory::{FactoryRecord, FactoryType};
use crate::listener::{ChainEvent, ChainEventListener, EventQueue, ListenerSet};
use crate::registry::{ChainConfig, ChainGroupConfig, ChannelConfig};
use crate::settings::FrameworkSettings;
use crate::time::TimerHandle;
use crate::types::{FlowType, RuntimeState};

/// 链注册表条目：配置与该链的监听器集合。
///
/// `listeners` 汇总全局、链组与直接挂载的全部来源；`direct` 只记录经链名直接挂载的监听器，
/// 直接移除不会消耗链组贡献的挂载。
pub(crate) struct ChainEntry {
    pub(crate) config: ChainConfig,
    pub(crate) listeners: ListenerSet,
    pub(crate) direct: ListenerSet,
}

/// 链组注册表条目。
pub(crate) struct GroupEntry {
    pub(crate) config: ChainGroupConfig,
    pub(crate) listeners: Vec<Arc<dyn ChainEventListener>>,
}

/// 运行通道。
///
/// 入站通道的键为通道名，可被多条链共享；出站通道的键附加链名，每条出站链独占自己的实例。
pub(crate) struct RunningChannel {
    pub(crate) config: ChannelConfig,
    pub(crate) channel: Box<dyn Channel>,
    pub(crate) state: RuntimeState,
    pub(crate) chains: Vec<String>,
    pub(crate) process: Option<DiscriminationHandle>,
}

/// 运行链。
pub(crate) struct RunningChain {
    pub(crate) config: ChainConfig,
    pub(crate) keys: Vec<String>,
    /// 已完成初始化的通道数；初始化失败后下一次启动从这里继续。
    pub(crate) initialized: usize,
    pub(crate) state: RuntimeState,
    pub(crate) quiesce: Option<TimerHandle>,
    pub(crate) generation: u64,
}

impl RunningChain {
    pub(crate) fn is_fully_initialized(&self) -> bool {
        self.initialized == self.keys.len()
    }
}

pub(crate) fn runtime_key(flow: FlowType, channel: &str, chain: &str) -> String {
    match flow {
        FlowType::Inbound => channel.to_owned(),
        FlowType::Outbound => format!("{channel}@{chain}"),
    }
}

/// 框架状态。
#[derive(Default)]
pub(crate) struct FrameworkState {
    pub(crate) factory_types: BTreeMap<String, FactoryType>,
    pub(crate) factories: BTreeMap<String, FactoryRecord>,
    pub(crate) channels: BTreeMap<String, ChannelConfig>,
    pub(crate) chains: BTreeMap<String, ChainEntry>,
    pub(crate) groups: BTreeMap<String, GroupEntry>,
    pub(crate) global_listeners: ListenerSet,
    pub(crate) running_chains: BTreeMap<String, RunningChain>,
    pub(crate) running_channels: BTreeMap<String, RunningChannel>,
    pub(crate) outbound: BTreeMap<String, OutboundEntry>,
    pub(crate) settings: FrameworkSettings,
    next_generation: u64,
    outbound_serial: u64,
}

impl FrameworkState {
    pub(crate) fn new(settings: FrameworkSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn next_outbound_serial(&mut self) -> u64 {
        self.outbound_serial += 1;
        self.outbound_serial
    }

    pub(crate) fn chain_entry(&self, name: &str) -> Result<&ChainEntry> {
        if name.is_empty() {
            return Err(FrameworkError::invalid_chain(name, "chain name is empty"));
        }
        self.chains
            .get(name)
            .ok_or_else(|| FrameworkError::invalid_chain(name, "chain not found"))
    }

    pub(crate) fn chain_state(&self, name: &str) -> RuntimeState {
        self.running_chains
            .get(name)
            .map_or(RuntimeState::Uninitialized, |running| running.state)
    }

    /// 把事件排入队列，收件人为链当前的监听器集合。
    pub(crate) fn notify(&self, chain: &str, event: ChainEvent, events: &mut EventQueue) {
        if let Some(entry) = self.chains.get(chain) {
            events.push(&entry.config, &entry.listeners, event);
        }
    }

    /// 除 `except` 外，仍有处于给定判定状态的运行链引用该运行通道。
    pub(crate) fn channel_needed_by_others(
        &self,
        key: &str,
        except: &str,
        needed: impl Fn(RuntimeState) -> bool,
    ) -> bool {
        let Some(running) = self.running_channels.get(key) else {
            return false;
        };
        running
            .chains
            .iter()
            .filter(|chain| chain.as_str() != except)
            .any(|chain| needed(self.chain_state(chain)))
    }

    /// 依次初始化运行链中尚未完成初始化的通道。
    pub(crate) fn init_channels(&mut self, chain: &str) -> Result<()> {
        loop {
            let (key, channel_name, flow) = {
                let Some(running) = self.running_chains.get(chain) else {
                    return Err(FrameworkError::invalid_chain(chain, "chain is not in the runtime"));
                };
                if running.is_fully_initialized() {
                    return Ok(());
                }
                let index = running.initialized;
                (
                    running.keys[index].clone(),
                    running.config.channels()[index].clone(),
                    running.config.flow(),
                )
            };

            if let Some(existing) = self.running_channels.get_mut(&key) {
                if !existing.chains.iter().any(|name| name == chain) {
                    existing.chains.push(chain.to_owned());
                }
            } else {
                let running = self.create_running_channel(chain, &channel_name, flow)?;
                self.running_channels.insert(key, running);
            }

            if let Some(running) = self.running_chains.get_mut(chain) {
                running.initialized += 1;
            }
        }
    }

    fn create_running_channel(
        &mut self,
        chain: &str,
        channel_name: &str,
        flow: FlowType,
    ) -> Result<RunningChannel> {
        let config = self
            .channels
            .get(channel_name)
            .cloned()
            .ok_or_else(|| FrameworkError::invalid_channel(channel_name, "channel not found"))?;
        let factory_type = config.factory_type().to_owned();
        let ty = self
            .factory_types
            .get(&factory_type)
            .ok_or_else(|| FrameworkError::InvalidFactory {
                factory_type: factory_type.clone(),
                reason: "factory type is not registered".into(),
            })?;
        let record = self.factories.entry(factory_type.clone()).or_default();

        let mut channel = record.create_channel(&factory_type, ty, &config, flow)?;
        if let Err(source) = channel.init() {
            record.discard_if_idle(&factory_type);
            return Err(FrameworkError::Channel {
                chain: chain.to_owned(),
                channel: channel_name.to_owned(),
                hook: "init",
                source,
            });
        }
        record.retain();

        let process = (flow == FlowType::Inbound).then(|| {
            let process = Arc::new(DiscriminationProcess::new(
                ty.descriptor.discriminatory_type,
            ));
            channel.discrimination_updated(Arc::clone(&process));
            Arc::new(ArcSwap::new(process))
        });
        debug!(chain, channel = channel_name, factory = %factory_type, "channel initialized");
        Ok(RunningChannel {
            config,
            channel,
            state: RuntimeState::Initialized,
            chains: vec![chain.to_owned()],
            process,
        })
    }

    /// 以写时复制方式把甄别器加入下方通道的甄别流程。
    pub(crate) fn add_discriminator(
        &mut self,
        lower_key: &str,
        discriminator: Arc<dyn Discriminator>,
        weight: i32,
    ) -> Result<()> {
        let Some(lower) = self.running_channels.get_mut(lower_key) else {
            return Ok(());
        };
        let Some(handle) = lower.process.as_ref() else {
            return Ok(());
        };
        let current = handle.load_full();
        let name = discriminator.channel_name().to_owned();
        if current
            .discriminators()
            .iter()
            .any(|(existing, existing_weight)| *existing == name && *existing_weight == weight)
        {
            return Ok(());
        }
        let mut next = current.unstarted_copy();
        next.add(discriminator, weight)?;
        next.start();
        let next = Arc::new(next);
        handle.store(Arc::clone(&next));
        lower.channel.discrimination_updated(next);
        debug!(channel = lower.config.name(), discriminator = %name, weight, "discriminator added");
        Ok(())
    }

    /// 以写时复制方式把甄别器移出下方通道的甄别流程。
    pub(crate) fn remove_discriminator(&mut self, lower_key: &str, discriminator: &str) {
        let Some(lower) = self.running_channels.get_mut(lower_key) else {
            return;
        };
        let Some(handle) = lower.process.as_ref() else {
            return;
        };
        let current = handle.load_full();
        if !current.contains(discriminator) {
            return;
        }
        let mut next = current.unstarted_copy();
        match next.remove(discriminator) {
            Ok(_) => {
                next.start();
                let next = Arc::new(next);
                handle.store(Arc::clone(&next));
                lower.channel.discrimination_updated(next);
                debug!(channel = lower.config.name(), discriminator, "discriminator removed");
            }
            Err(error) => warn!(channel = lower.config.name(), %error, "discriminator removal failed"),
        }
    }

    /// 把入站链中每个通道的甄别器挂到其下方邻居上。
    pub(crate) fn wire_discriminators(&mut self, chain: &str) -> Result<()> {
        let Some(running) = self.running_chains.get(chain) else {
            return Ok(());
        };
        if running.config.flow() != FlowType::Inbound {
            return Ok(());
        }
        let keys = running.keys.clone();
        for index in (1..keys.len()).rev() {
            let Some(upper) = self.running_channels.get(&keys[index]) else {
                continue;
            };
            let Some(discriminator) = upper.channel.discriminator() else {
                continue;
            };
            let weight = upper.config.weight();
            self.add_discriminator(&keys[index - 1], discriminator, weight)?;
        }
        Ok(())
    }

    /// 上方通道停止时撤下它的甄别器。
    pub(crate) fn unwire_discriminator(&mut self, lower_key: &str, upper_key: &str) {
        let name = self
            .running_channels
            .get(upper_key)
            .and_then(|upper| upper.channel.discriminator())
            .map(|discriminator| discriminator.channel_name().to_owned());
        if let Some(name) = name {
            self.remove_discriminator(lower_key, &name);
        }
    }

    /// 除 `except` 外，仍有活动链把 `upper` 直接叠放在 `lower` 之上。
    fn adjacency_needed_by_others(&self, lower: &str, upper: &str, except: &str) -> bool {
        self.running_chains
            .iter()
            .filter(|(chain, running)| chain.as_str() != except && running.state.is_running())
            .any(|(_, running)| {
                running
                    .keys
                    .windows(2)
                    .any(|pair| pair[0] == lower && pair[1] == upper)
            })
    }

    /// 撤下入站链在每对相邻通道之间挂载的甄别器，其他活动链仍依赖的相邻关系保留。
    pub(crate) fn unwire_chain(&mut self, chain: &str, keys: &[String]) {
        for index in (1..keys.len()).rev() {
            let (lower, upper) = (&keys[index - 1], &keys[index]);
            if self.adjacency_needed_by_others(lower, upper, chain) {
                continue;
            }
            self.unwire_discriminator(lower, upper);
        }
    }

    /// 通道权重更新后，重排所有包含其甄别器的甄别流程。
    pub(crate) fn reweigh_discriminator(&mut self, channel: &str, weight: i32) -> Result<()> {
        let Some(upper) = self.running_channels.get(channel) else {
            return Ok(());
        };
        let Some(discriminator) = upper.channel.discriminator() else {
            return Ok(());
        };
        let name = discriminator.channel_name().to_owned();
        let lowers: Vec<String> = self
            .running_channels
            .iter()
            .filter(|(_, running)| {
                running
                    .process
                    .as_ref()
                    .is_some_and(|handle| handle.load().contains(&name))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for lower in lowers {
            self.add_discriminator(&lower, Arc::clone(&discriminator), weight)?;
        }
        Ok(())
    }

    /// 从运行表中移除无人引用的运行通道并释放工厂引用。
    pub(crate) fn drop_channel_reference(&mut self, chain: &str, key: &str) {
        let Some(running) = self.running_channels.get_mut(key) else {
            return;
        };
        running.chains.retain(|name| name != chain);
        if !running.chains.is_empty() {
            return;
        }
        let Some(mut running) = self.running_channels.remove(key) else {
            return;
        };
        // 链在部分启动后失败时，前面的通道可能仍在运行。
        if running.state.is_running()
            && let Err(error) = running.channel.stop(Duration::ZERO)
        {
            warn!(chain, channel = running.config.name(), %error, "channel stop failed");
        }
        if let Err(error) = running.channel.destroy() {
            warn!(chain, channel = running.config.name(), %error, "channel destroy failed");
        }
        let factory_type = running.config.factory_type().to_owned();
        if let Some(record) = self.factories.get_mut(&factory_type) {
            record.release(&factory_type);
        }
        debug!(chain, channel = running.config.name(), "channel destroyed");
    }
}
