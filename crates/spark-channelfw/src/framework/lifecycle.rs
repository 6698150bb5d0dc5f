//! 链生命周期状态机：`UNINITIALIZED → INITIALIZED → STARTED → QUIESCED → INITIALIZED`。
//!
//! 共享通道的钩子只在必要时调用：启动时跳过已启动的通道，停止时保留仍被其他活动链需要的
//! 通道，销毁时只拆除不再被任何运行链引用的通道。

use std::time::Duration;

use tracing::{debug, info, warn};

use super::state::{FrameworkState, RunningChain, runtime_key};
use super::{ChannelFramework, Inner, Quiescer};
use crate::error::{FrameworkError, Result};
use crate::listener::{ChainEvent, EventQueue};
use crate::types::{FlowType, RuntimeState};

impl FrameworkState {
    /// 拒绝直接驱动出站链。
    pub(crate) fn require_inbound(&self, name: &str) -> Result<()> {
        let entry = self.chain_entry(name)?;
        if entry.config.flow() == FlowType::Outbound {
            return Err(FrameworkError::invalid_chain(
                name,
                "outbound chains are driven through their virtual connection factory",
            ));
        }
        Ok(())
    }

    pub(crate) fn init_chain(&mut self, name: &str, events: &mut EventQueue) -> Result<()> {
        let config = self.chain_entry(name)?.config.clone();
        match self.running_chains.get(name) {
            Some(running) if running.is_fully_initialized() => {
                return Err(FrameworkError::InvalidRuntimeState {
                    chain: name.to_owned(),
                    operation: "init",
                    state: running.state,
                });
            }
            Some(_) => debug!(chain = name, "resuming partial chain initialization"),
            None => {
                let keys = config
                    .channels()
                    .iter()
                    .map(|channel| runtime_key(config.flow(), channel, name))
                    .collect();
                let generation = self.next_generation();
                self.running_chains.insert(
                    name.to_owned(),
                    RunningChain {
                        config,
                        keys,
                        initialized: 0,
                        state: RuntimeState::Initialized,
                        quiesce: None,
                        generation,
                    },
                );
            }
        }

        self.init_channels(name)?;
        info!(chain = name, "chain initialized");
        self.notify(name, ChainEvent::Initialized, events);
        Ok(())
    }

    /// 启动链；返回链是否发生了状态迁移。
    pub(crate) fn start_chain(&mut self, name: &str, events: &mut EventQueue) -> Result<bool> {
        let entry = self.chain_entry(name)?;
        if !entry.config.is_enabled() {
            debug!(chain = name, "skipping start of disabled chain");
            return Ok(false);
        }
        match self.running_chains.get(name) {
            None => self.init_chain(name, events)?,
            Some(running) if running.state == RuntimeState::Quiesced => {
                return Err(FrameworkError::InvalidRuntimeState {
                    chain: name.to_owned(),
                    operation: "start",
                    state: RuntimeState::Quiesced,
                });
            }
            Some(running) if running.state == RuntimeState::Started => return Ok(false),
            Some(running) if !running.is_fully_initialized() => {
                self.init_chain(name, events)?;
            }
            Some(_) => {}
        }

        self.wire_discriminators(name)?;
        let keys = self
            .running_chains
            .get(name)
            .map(|running| running.keys.clone())
            .unwrap_or_default();
        for key in &keys {
            let Some(running) = self.running_channels.get_mut(key) else {
                continue;
            };
            if running.state == RuntimeState::Started {
                continue;
            }
            running
                .channel
                .start()
                .map_err(|source| FrameworkError::Channel {
                    chain: name.to_owned(),
                    channel: running.config.name().to_owned(),
                    hook: "start",
                    source,
                })?;
            running.state = RuntimeState::Started;
            debug!(chain = name, channel = running.config.name(), "channel started");
        }

        if let Some(running) = self.running_chains.get_mut(name) {
            running.state = RuntimeState::Started;
        }
        info!(chain = name, "chain started");
        self.notify(name, ChainEvent::Started, events);
        Ok(true)
    }

    /// 停止链；返回链是否发生了状态迁移。
    pub(crate) fn stop_chain(
        &mut self,
        name: &str,
        timeout_millis: i64,
        quiescer: &Quiescer,
        events: &mut EventQueue,
    ) -> Result<bool> {
        if timeout_millis < 0 {
            return Err(FrameworkError::InvalidTimer {
                chain: name.to_owned(),
                millis: timeout_millis,
            });
        }
        let Some(running) = self.running_chains.get(name) else {
            debug!(chain = name, "stop of a chain outside the runtime ignored");
            return Ok(false);
        };
        match running.state {
            RuntimeState::Quiesced => {
                self.finish_stop(name, events);
                Ok(true)
            }
            RuntimeState::Started if timeout_millis == 0 => {
                self.finish_stop(name, events);
                Ok(true)
            }
            RuntimeState::Started => {
                self.quiesce(name, timeout_millis, quiescer, events);
                Ok(true)
            }
            RuntimeState::Initialized | RuntimeState::Uninitialized => Ok(false),
        }
    }

    fn quiesce(
        &mut self,
        name: &str,
        timeout_millis: i64,
        quiescer: &Quiescer,
        events: &mut EventQueue,
    ) {
        let timeout = Duration::from_millis(u64::try_from(timeout_millis).unwrap_or(0));
        let keys = self
            .running_chains
            .get(name)
            .map(|running| running.keys.clone())
            .unwrap_or_default();
        for key in keys.iter().rev() {
            if self.channel_needed_by_others(key, name, |state| state == RuntimeState::Started) {
                continue;
            }
            let Some(running) = self.running_channels.get_mut(key) else {
                continue;
            };
            if running.state != RuntimeState::Started {
                continue;
            }
            if let Err(error) = running.channel.stop(timeout) {
                warn!(chain = name, channel = running.config.name(), %error, "channel quiesce failed");
            }
            running.state = RuntimeState::Quiesced;
        }

        let generation = self.next_generation();
        let scheduled = quiescer.schedule(name, generation, timeout);
        let Some(running) = self.running_chains.get_mut(name) else {
            return;
        };
        running.state = RuntimeState::Quiesced;
        running.generation = generation;
        info!(chain = name, timeout_ms = timeout_millis, "chain quiesced");
        self.notify(name, ChainEvent::Quiesced, events);
        match scheduled {
            Ok(handle) => {
                if let Some(running) = self.running_chains.get_mut(name) {
                    running.quiesce = Some(handle);
                }
            }
            Err(error) => {
                warn!(chain = name, %error, "quiesce timer unavailable; stopping immediately");
                self.finish_stop(name, events);
            }
        }
    }

    /// 完成停止：`STARTED|QUIESCED → INITIALIZED`。
    pub(crate) fn finish_stop(&mut self, name: &str, events: &mut EventQueue) {
        let Some(running) = self.running_chains.get_mut(name) else {
            return;
        };
        if let Some(timer) = running.quiesce.take() {
            timer.cancel();
        }
        let keys = running.keys.clone();
        if running.config.flow() == FlowType::Inbound {
            self.unwire_chain(name, &keys);
        }

        for key in keys.iter().rev() {
            if self.channel_needed_by_others(key, name, RuntimeState::is_running) {
                continue;
            }
            if let Some(running) = self.running_channels.get_mut(key)
                && running.state.is_running()
            {
                if let Err(error) = running.channel.stop(Duration::ZERO) {
                    warn!(chain = name, channel = running.config.name(), %error, "channel stop failed");
                }
                running.state = RuntimeState::Initialized;
                debug!(chain = name, channel = running.config.name(), "channel stopped");
            }
        }

        let generation = self.next_generation();
        if let Some(running) = self.running_chains.get_mut(name) {
            running.state = RuntimeState::Initialized;
            running.generation = generation;
        }
        info!(chain = name, "chain stopped");
        self.notify(name, ChainEvent::Stopped, events);
    }

    /// 销毁链；返回链是否确实离开了运行表。
    pub(crate) fn destroy_chain(&mut self, name: &str, events: &mut EventQueue) -> Result<bool> {
        self.chain_entry(name)?;
        let Some(running) = self.running_chains.get(name) else {
            return Ok(false);
        };
        if running.state.is_running() {
            return Err(FrameworkError::InvalidRuntimeState {
                chain: name.to_owned(),
                operation: "destroy",
                state: running.state,
            });
        }
        let keys: Vec<String> = running.keys[..running.initialized].to_vec();
        // 启动失败的链可能已挂上甄别器却从未进入活动状态。
        if running.config.flow() == FlowType::Inbound {
            self.unwire_chain(name, &keys);
        }

        for key in keys.iter().rev() {
            self.drop_channel_reference(name, key);
        }

        self.running_chains.remove(name);
        info!(chain = name, "chain destroyed");
        self.notify(name, ChainEvent::Destroyed, events);
        Ok(true)
    }
}

impl Inner {
    /// 静默定时器到期：仅当链仍处于同一轮静默时完成停止。
    pub(crate) fn quiesce_expired(&self, chain: &str, generation: u64) {
        self.transact(|state, events| {
            let current = state
                .running_chains
                .get(chain)
                .filter(|running| running.state == RuntimeState::Quiesced)
                .map(|running| running.generation);
            if current == Some(generation) {
                debug!(chain, "quiesce timeout elapsed");
                state.finish_stop(chain, events);
            }
        });
    }
}

impl ChannelFramework {
    /// 初始化入站链。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：按管线顺序创建运行通道并调用 `init`，共享通道只登记引用；
    ///   已完成初始化的链返回 [`FrameworkError::InvalidRuntimeState`]；
    /// - **风险 (Trade-offs)**：失败时不回滚已初始化的通道，链保留在运行表中，
    ///   之后的 `init_chain`/`start_chain` 从失败处继续。
    pub fn init_chain(&self, name: &str) -> Result<()> {
        self.inner.transact(|state, events| {
            state.require_inbound(name)?;
            state.init_chain(name, events)
        })
    }

    /// 启动入站链；尚未初始化时先初始化，已启动时为空操作。
    ///
    /// 只有通道或工厂钩子失败才派发 `chain_start_failed(1, 0)`；状态守卫拒绝不算一次尝试。
    pub fn start_chain(&self, name: &str) -> Result<()> {
        self.inner.transact(|state, events| {
            state.require_inbound(name)?;
            let result = state.start_chain(name, events);
            if let Err(error) = &result
                && error.is_hook_failure()
            {
                warn!(chain = name, %error, "chain start failed");
                state.notify(
                    name,
                    ChainEvent::StartFailed {
                        attempts_made: 1,
                        attempts_left: 0,
                    },
                    events,
                );
            }
            result.map(|_| ())
        })
    }

    /// 停止入站链。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - `timeout_millis < 0` 返回 [`FrameworkError::InvalidTimer`]；
    ///   - `STARTED` 且超时为正：立即进入 `QUIESCED` 并派发 `chain_quiesced`，超时后在定时器
    ///     上下文中完成停止并派发 `chain_stopped`；
    ///   - `STARTED` 且超时为零，或任何对 `QUIESCED` 链的调用：取消定时器并同步完成停止；
    ///   - `INITIALIZED`、不在运行表中或未知的链：空操作。
    pub fn stop_chain(&self, name: &str, timeout_millis: i64) -> Result<()> {
        let quiescer = self.quiescer();
        self.inner.transact(|state, events| {
            if state.chains.contains_key(name) {
                state.require_inbound(name)?;
            }
            state
                .stop_chain(name, timeout_millis, &quiescer, events)
                .map(|_| ())
        })
    }

    /// 以框架设置中的默认静默时长停止链。
    pub fn quiesce_chain(&self, name: &str) -> Result<()> {
        let timeout = self.inner.state.lock().settings.default_chain_quiesce_timeout();
        self.stop_chain(name, timeout)
    }

    /// 提前结束链的静默，例如存量工作已经排空；对非静默链为空操作。
    pub fn complete_quiesce(&self, name: &str) -> Result<()> {
        self.inner.transact(|state, events| {
            state.require_inbound(name)?;
            if state.chain_state(name) == RuntimeState::Quiesced {
                state.finish_stop(name, events);
            }
            Ok(())
        })
    }

    /// 销毁入站链；`STARTED`/`QUIESCED` 时返回 [`FrameworkError::InvalidRuntimeState`]。
    pub fn destroy_chain(&self, name: &str) -> Result<()> {
        self.inner.transact(|state, events| {
            state.require_inbound(name)?;
            state.destroy_chain(name, events).map(|_| ())
        })
    }
}
