//! # 链组与监听器扇出
//!
//! ## 核心意图（Why）
//! - 链组把若干链聚成一个运维单元：监听器一次挂到全部成员，生命周期操作批量执行；
//! - 批量操作不是原子的：每条链在自己的临界区内迁移，首个失败即中止，
//!   已完成迁移的链保持原样，并随错误一并报告。
//!
//! ## 行为契约（What）
//! - 监听器以挂载路径计数：直接挂载、每个链组、全局 [`ALL_CHAINS`] 各算一条路径；
//! - 批量操作跳过出站链，出站链只由出站虚拟连接工厂驱动；
//! - 重试模式下两次尝试之间的等待不持有框架锁。

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use super::ChannelFramework;
use super::state::{FrameworkState, GroupEntry};
use crate::error::{FrameworkError, Result};
use crate::listener::{ALL_CHAINS, ChainEvent, ChainEventListener};
use crate::registry::ChainGroupConfig;
use crate::settings::{ChainStartMode, RetryPolicy};
use crate::types::FlowType;

impl FrameworkState {
    fn group_entry(&self, name: &str) -> Result<&GroupEntry> {
        if name.is_empty() {
            return Err(FrameworkError::group(name, "group name is empty"));
        }
        self.groups
            .get(name)
            .ok_or_else(|| FrameworkError::group(name, "group not found"))
    }

    fn validate_members(&self, chains: &[String]) -> Result<()> {
        for chain in chains {
            self.chain_entry(chain)?;
        }
        Ok(())
    }

    fn attach_to_chain(&mut self, chain: &str, listeners: &[Arc<dyn ChainEventListener>]) {
        if let Some(entry) = self.chains.get_mut(chain) {
            for listener in listeners {
                entry.listeners.attach(listener);
            }
        }
    }

    fn detach_from_chain(&mut self, chain: &str, listeners: &[Arc<dyn ChainEventListener>]) {
        if let Some(entry) = self.chains.get_mut(chain) {
            for listener in listeners {
                entry.listeners.detach(listener);
            }
        }
    }

    /// 链组中可被批量驱动的入站成员。
    fn inbound_members(&self, group: &str) -> Result<Vec<String>> {
        let entry = self.group_entry(group)?;
        Ok(entry
            .config
            .chains()
            .iter()
            .filter(|chain| {
                let inbound = self
                    .chains
                    .get(chain.as_str())
                    .is_some_and(|entry| entry.config.flow() == FlowType::Inbound);
                if !inbound {
                    debug!(group, chain = %chain, "skipping outbound chain in group operation");
                }
                inbound
            })
            .cloned()
            .collect())
    }
}

fn aborted(group: &str, chain: &str, changed: Vec<String>, source: FrameworkError) -> FrameworkError {
    warn!(group, chain, error = %source, changed = changed.len(), "group operation aborted");
    FrameworkError::GroupOperation {
        group: group.to_owned(),
        chain: chain.to_owned(),
        changed,
        source: Box::new(source),
    }
}

impl ChannelFramework {
    /// 挂载链事件监听器；`chain` 为 [`ALL_CHAINS`] 时挂到全局，覆盖现有与未来的全部链。
    pub fn add_chain_event_listener(
        &self,
        listener: Arc<dyn ChainEventListener>,
        chain: &str,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if chain == ALL_CHAINS {
            if state.global_listeners.contains(&listener) {
                return Ok(());
            }
            state.global_listeners.attach(&listener);
            for entry in state.chains.values_mut() {
                entry.listeners.attach(&listener);
            }
            debug!("global chain listener added");
            return Ok(());
        }
        state.chain_entry(chain)?;
        if let Some(entry) = state.chains.get_mut(chain)
            && entry.direct.attach(&listener)
        {
            entry.listeners.attach(&listener);
        }
        Ok(())
    }

    /// 移除链事件监听器。
    ///
    /// 全局监听器只能通过 [`ALL_CHAINS`] 移除，经由具体链名移除返回
    /// [`FrameworkError::InvalidChainName`]；只经链组挂上的监听器须通过链组撤下，
    /// 经由链名移除返回 [`FrameworkError::InvalidArgument`]。
    pub fn remove_chain_event_listener(
        &self,
        listener: &Arc<dyn ChainEventListener>,
        chain: &str,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if chain == ALL_CHAINS {
            if state.global_listeners.purge(listener) {
                for entry in state.chains.values_mut() {
                    entry.listeners.detach(listener);
                }
                debug!("global chain listener removed");
            }
            return Ok(());
        }
        state.chain_entry(chain)?;
        if state.global_listeners.contains(listener) {
            return Err(FrameworkError::invalid_chain(
                chain,
                "global listeners must be removed through ALL_CHAINS",
            ));
        }
        let Some(entry) = state.chains.get_mut(chain) else {
            return Ok(());
        };
        if !entry.direct.purge(listener) {
            return Err(FrameworkError::InvalidArgument {
                operation: "remove_chain_event_listener".to_owned(),
                reason: format!("listener is not attached directly to chain {chain}"),
            });
        }
        entry.listeners.detach(listener);
        Ok(())
    }

    /// 链上登记的不同监听器个数。
    pub fn listener_count_for(&self, chain: &str) -> Result<usize> {
        let state = self.inner.state.lock();
        Ok(state.chain_entry(chain)?.listeners.len())
    }

    /// 新建链组；成员必须是已配置的链。
    pub fn add_chain_group(&self, name: &str, chains: &[&str]) -> Result<ChainGroupConfig> {
        if name.is_empty() {
            return Err(FrameworkError::group(name, "group name is empty"));
        }
        let chains: Vec<String> = chains.iter().map(|chain| (*chain).to_owned()).collect();
        let mut state = self.inner.state.lock();
        if state.groups.contains_key(name) {
            return Err(FrameworkError::group(name, "group already exists"));
        }
        state.validate_members(&chains)?;
        let config = ChainGroupConfig::new(name, &chains);
        state.groups.insert(
            name.to_owned(),
            GroupEntry {
                config: config.clone(),
                listeners: Vec::new(),
            },
        );
        info!(group = name, chains = ?config.chains(), "chain group added");
        Ok(config)
    }

    /// 删除链组，并从成员链上撤下该组的监听器。
    pub fn remove_chain_group(&self, name: &str) -> Result<ChainGroupConfig> {
        let mut state = self.inner.state.lock();
        state.group_entry(name)?;
        let Some(entry) = state.groups.remove(name) else {
            return Err(FrameworkError::group(name, "group not found"));
        };
        for chain in entry.config.chains() {
            state.detach_from_chain(chain, &entry.listeners);
        }
        info!(group = name, "chain group removed");
        Ok(entry.config)
    }

    /// 整体替换链组成员，离开的链撤下、新加入的链挂上该组的监听器。
    pub fn update_chain_group(&self, name: &str, chains: &[&str]) -> Result<ChainGroupConfig> {
        let chains: Vec<String> = chains.iter().map(|chain| (*chain).to_owned()).collect();
        let mut state = self.inner.state.lock();
        let previous = state.group_entry(name)?.config.clone();
        state.validate_members(&chains)?;
        let next = ChainGroupConfig::new(name, &chains);
        let listeners = state
            .groups
            .get(name)
            .map(|entry| entry.listeners.clone())
            .unwrap_or_default();
        for chain in previous.chains().iter().filter(|chain| !next.contains(chain)) {
            state.detach_from_chain(chain, &listeners);
        }
        for chain in next.chains().iter().filter(|chain| !previous.contains(chain)) {
            state.attach_to_chain(chain, &listeners);
        }
        if let Some(entry) = state.groups.get_mut(name) {
            entry.config = next.clone();
        }
        info!(group = name, chains = ?next.chains(), "chain group updated");
        Ok(next)
    }

    /// 把链加入链组；已是成员时为空操作。
    pub fn add_chain_to_group(&self, group: &str, chain: &str) -> Result<ChainGroupConfig> {
        let mut state = self.inner.state.lock();
        state.group_entry(group)?;
        state.chain_entry(chain)?;
        let Some(entry) = state.groups.get_mut(group) else {
            return Err(FrameworkError::group(group, "group not found"));
        };
        if !entry.config.insert(chain) {
            return Ok(entry.config.clone());
        }
        let listeners = entry.listeners.clone();
        let config = entry.config.clone();
        state.attach_to_chain(chain, &listeners);
        debug!(group, chain, "chain joined group");
        Ok(config)
    }

    /// 把链移出链组，撤下该组挂载的监听器；仍经由其他路径挂载的监听器保留。
    pub fn remove_chain_from_group(&self, group: &str, chain: &str) -> Result<ChainGroupConfig> {
        let mut state = self.inner.state.lock();
        state.group_entry(group)?;
        state.chain_entry(chain)?;
        let Some(entry) = state.groups.get_mut(group) else {
            return Err(FrameworkError::group(group, "group not found"));
        };
        if !entry.config.remove(chain) {
            return Ok(entry.config.clone());
        }
        let listeners = entry.listeners.clone();
        let config = entry.config.clone();
        state.detach_from_chain(chain, &listeners);
        debug!(group, chain, "chain left group");
        Ok(config)
    }

    /// 链组快照。
    pub fn get_chain_group(&self, name: &str) -> Option<ChainGroupConfig> {
        self.inner
            .state
            .lock()
            .groups
            .get(name)
            .map(|entry| entry.config.clone())
    }

    /// 全部链组。
    pub fn get_all_chain_groups(&self) -> Vec<ChainGroupConfig> {
        self.inner
            .state
            .lock()
            .groups
            .values()
            .map(|entry| entry.config.clone())
            .collect()
    }

    /// 包含指定链的全部链组。
    pub fn get_all_chain_groups_for(&self, chain: &str) -> Result<Vec<ChainGroupConfig>> {
        let state = self.inner.state.lock();
        state.chain_entry(chain)?;
        Ok(state
            .groups
            .values()
            .filter(|entry| entry.config.contains(chain))
            .map(|entry| entry.config.clone())
            .collect())
    }

    /// 给链组挂载监听器并扇出到每个成员链；同一监听器重复挂到同一组为空操作。
    pub fn add_group_listener(
        &self,
        group: &str,
        listener: Arc<dyn ChainEventListener>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.group_entry(group)?;
        let Some(entry) = state.groups.get_mut(group) else {
            return Err(FrameworkError::group(group, "group not found"));
        };
        if entry
            .listeners
            .iter()
            .any(|existing| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(&listener)))
        {
            return Ok(());
        }
        entry.listeners.push(Arc::clone(&listener));
        let members = entry.config.chains().to_vec();
        let listeners = [listener];
        for chain in &members {
            state.attach_to_chain(chain, &listeners);
        }
        debug!(group, members = members.len(), "group listener added");
        Ok(())
    }

    /// 从链组撤下监听器及其在成员链上的挂载路径。
    pub fn remove_group_listener(
        &self,
        group: &str,
        listener: &Arc<dyn ChainEventListener>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.group_entry(group)?;
        let Some(entry) = state.groups.get_mut(group) else {
            return Err(FrameworkError::group(group, "group not found"));
        };
        let before = entry.listeners.len();
        entry
            .listeners
            .retain(|existing| !std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(listener)));
        if before == entry.listeners.len() {
            return Ok(());
        }
        let members = entry.config.chains().to_vec();
        let listeners = [Arc::clone(listener)];
        for chain in &members {
            state.detach_from_chain(chain, &listeners);
        }
        debug!(group, "group listener removed");
        Ok(())
    }

    fn group_members(&self, group: &str) -> Result<Vec<String>> {
        self.inner.state.lock().inbound_members(group)
    }

    /// 初始化链组中尚未完成初始化的入站链，返回发生迁移的链。
    pub fn init_chain_group(&self, group: &str) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for chain in self.group_members(group)? {
            let result = self.inner.transact(|state, events| {
                if state
                    .running_chains
                    .get(&chain)
                    .is_some_and(|running| running.is_fully_initialized())
                {
                    debug!(group, chain = %chain, "chain already initialized");
                    return Ok(false);
                }
                state.init_chain(&chain, events).map(|()| true)
            });
            match result {
                Ok(true) => changed.push(chain),
                Ok(false) => {}
                Err(error) => return Err(aborted(group, &chain, changed, error)),
            }
        }
        Ok(changed)
    }

    /// 启动链组中的入站链，返回发生迁移的链。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 停用的链被跳过；
    ///   - [`ChainStartMode::FailEachSilent`]：首个失败的链收到 `chain_start_failed(1, 0)`，
    ///     操作以 [`FrameworkError::GroupOperation`] 中止；
    ///   - [`ChainStartMode::RetryEachOnFail`]：可重试失败按策略重试，每次失败都派发
    ///     `chain_start_failed(已尝试, 剩余)`；次数耗尽的链被排除在结果之外，其余链继续启动；
    /// - **风险 (Trade-offs)**：重试在调用线程上同步等待，间隔内不持有框架锁。
    pub fn start_chain_group(&self, group: &str, mode: ChainStartMode) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for chain in self.group_members(group)? {
            let outcome = match mode {
                ChainStartMode::FailEachSilent => self.start_member(&chain, None, 1),
                ChainStartMode::RetryEachOnFail(policy) => self.start_member_retrying(&chain, policy),
            };
            match outcome {
                Ok(true) => changed.push(chain),
                Ok(false) => {}
                Err(error) => return Err(aborted(group, &chain, changed, error)),
            }
        }
        info!(group, started = changed.len(), "chain group started");
        Ok(changed)
    }

    /// 单次启动尝试；失败时在同一临界区内排入 `chain_start_failed`。
    fn start_member(&self, chain: &str, policy: Option<&RetryPolicy>, attempt: u32) -> Result<bool> {
        self.inner.transact(|state, events| {
            let result = state.start_chain(chain, events);
            if let Err(error) = &result
                && error.is_hook_failure()
            {
                let attempts_left = match policy {
                    Some(policy) if error.is_retryable() => policy.attempts_left(attempt),
                    _ => 0,
                };
                state.notify(
                    chain,
                    ChainEvent::StartFailed {
                        attempts_made: attempt,
                        attempts_left,
                    },
                    events,
                );
            }
            result
        })
    }

    fn start_member_retrying(&self, chain: &str, policy: RetryPolicy) -> Result<bool> {
        let mut attempt = 1;
        loop {
            match self.start_member(chain, Some(&policy), attempt) {
                Ok(changed) => return Ok(changed),
                Err(error) if error.is_retryable() => {
                    if policy.attempts_left(attempt) == 0 {
                        warn!(chain, attempts = attempt, %error, "chain start retries exhausted");
                        return Ok(false);
                    }
                    debug!(chain, attempt, %error, "retrying chain start");
                    thread::sleep(policy.interval);
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// 停止链组中的入站链，返回发生迁移的链。
    pub fn stop_chain_group(&self, group: &str, timeout_millis: i64) -> Result<Vec<String>> {
        if timeout_millis < 0 {
            return Err(FrameworkError::InvalidTimer {
                chain: group.to_owned(),
                millis: timeout_millis,
            });
        }
        let quiescer = self.quiescer();
        let mut changed = Vec::new();
        for chain in self.group_members(group)? {
            let result = self
                .inner
                .transact(|state, events| state.stop_chain(&chain, timeout_millis, &quiescer, events));
            match result {
                Ok(true) => changed.push(chain),
                Ok(false) => {}
                Err(error) => return Err(aborted(group, &chain, changed, error)),
            }
        }
        info!(group, stopped = changed.len(), "chain group stopped");
        Ok(changed)
    }

    /// 销毁链组中已初始化的入站链，返回发生迁移的链。
    pub fn destroy_chain_group(&self, group: &str) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for chain in self.group_members(group)? {
            let result = self
                .inner
                .transact(|state, events| state.destroy_chain(&chain, events));
            match result {
                Ok(true) => changed.push(chain),
                Ok(false) => {}
                Err(error) => return Err(aborted(group, &chain, changed, error)),
            }
        }
        info!(group, destroyed = changed.len(), "chain group destroyed");
        Ok(changed)
    }
}
