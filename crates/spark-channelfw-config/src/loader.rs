//! # 属性表装载器
//!
//! ## 核心意图（Why）
//! - 把 [`PropertyMap`] 描述的目标状态落到一个 [`ChannelFramework`] 上，并在配置替换时
//!   只触碰真正变化的条目；
//! - 运行中的链在结构性变化（通道列表、流向、通道工厂类型）后需要重建，属性与权重变化则直接推送。
//!
//! ## 行为契约（What）
//! - [`ConfigLoader::load`] 幂等：同一张表装载两次，第二次的 [`ChangeSummary`] 为空；
//! - 应用顺序固定为端点、工厂属性、通道、链、链组，保证引用方在被引用方之后出现；
//! - 首个框架错误即中止，已应用的条目不回滚；
//! - [`ConfigLoader::start_config`] 先删除旧表独有的条目，再应用新表，最后重启受影响的入站链
//!   并启动新增且启用的入站链。
//!
//! ## 风险提示（Trade-offs）
//! - 重建链使用零静默时长立即停止，正在处理的连接不会等待排空。

use std::collections::{BTreeMap, BTreeSet};

use spark_channelfw::{ChannelFramework, FlowType, RuntimeState};
use tracing::{debug, info, instrument};

use crate::error::{ConfigError, Result};
use crate::map::{Category, PropertyMap};

/// 一次装载中发生变化的条目名，按类别归档。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeSummary {
    changes: BTreeMap<Category, BTreeSet<String>>,
}

impl ChangeSummary {
    /// 指定类别下变化的名称，按字典序排列。
    pub fn get(&self, category: Category) -> Vec<&str> {
        self.changes
            .get(&category)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// 名称是否在指定类别下发生了变化。
    pub fn contains(&self, category: Category, name: &str) -> bool {
        self.changes
            .get(&category)
            .is_some_and(|names| names.contains(name))
    }

    /// 没有任何变化。
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn record(&mut self, category: Category, name: &str) {
        self.changes
            .entry(category)
            .or_default()
            .insert(name.to_owned());
    }

    fn merge(&mut self, other: ChangeSummary) {
        for (category, names) in other.changes {
            self.changes.entry(category).or_default().extend(names);
        }
    }
}

/// 把属性表应用到框架上的装载器。
#[derive(Clone)]
pub struct ConfigLoader {
    framework: ChannelFramework,
}

impl ConfigLoader {
    /// 绑定到一个框架句柄。
    pub fn new(framework: &ChannelFramework) -> Self {
        Self {
            framework: framework.clone(),
        }
    }

    /// 将属性表增量应用到框架。
    #[instrument(skip_all, fields(entries = map.len()))]
    pub fn load(&self, map: &PropertyMap) -> Result<ChangeSummary> {
        let mut summary = ChangeSummary::default();
        if let Some(settings) = map.settings()
            && *settings != self.framework.settings()
        {
            self.framework.update_settings(settings.clone());
            info!("framework settings replaced");
        }
        self.load_endpoints(map, &mut summary)?;
        self.load_factories(map, &mut summary)?;
        self.load_channels(map, &mut summary)?;
        self.load_chains(map, &mut summary)?;
        self.load_groups(map, &mut summary)?;
        debug!(?summary, "property map applied");
        Ok(summary)
    }

    fn load_endpoints(&self, map: &PropertyMap, summary: &mut ChangeSummary) -> Result<()> {
        let endpoints = self.framework.endpoints();
        for name in map.names(Category::Endpoint) {
            let Some(endpoint) = map.endpoint(name)? else {
                continue;
            };
            if endpoints.resolve(name).as_ref() != Some(&endpoint) {
                endpoints.define(name, endpoint);
                summary.record(Category::Endpoint, name);
            }
        }
        Ok(())
    }

    fn load_factories(&self, map: &PropertyMap, summary: &mut ChangeSummary) -> Result<()> {
        for name in map.names(Category::Factory) {
            let key = Category::Factory.key(name);
            let properties = map.attributes(Category::Factory, name)?.unwrap_or_default();
            let current = self
                .framework
                .get_channel_factory(name)
                .map(|data| data.properties().clone())
                .unwrap_or_default();
            if current != properties {
                self.framework
                    .update_all_channel_factory_properties(name, properties)
                    .map_err(|source| ConfigError::framework(&key, source))?;
                summary.record(Category::Factory, name);
            }
        }
        Ok(())
    }

    fn load_channels(&self, map: &PropertyMap, summary: &mut ChangeSummary) -> Result<()> {
        for name in map.names(Category::Channel) {
            let key = Category::Channel.key(name);
            let Some(spec) = map.channel(name)? else {
                continue;
            };
            let framework_error = |source| ConfigError::framework(&key, source);

            let existing = match self.framework.get_channel(name) {
                Some(existing) if existing.factory_type() != spec.factory_type => {
                    // 工厂类型无法原地替换；引用它的链随之被移除，稍后由链阶段重新加入。
                    self.framework.remove_channel(name).map_err(framework_error)?;
                    info!(channel = name, factory = %spec.factory_type, "channel factory type replaced");
                    None
                }
                other => other,
            };

            let Some(existing) = existing else {
                self.framework
                    .add_channel(name, &spec.factory_type, spec.properties, spec.weight)
                    .map_err(framework_error)?;
                summary.record(Category::Channel, name);
                continue;
            };

            if *existing.properties() != spec.properties {
                self.framework
                    .update_all_channel_properties(name, spec.properties)
                    .map_err(framework_error)?;
                summary.record(Category::Channel, name);
            }
            if let Some(weight) = spec.weight
                && weight != existing.weight()
            {
                self.framework
                    .update_channel_weight(name, weight)
                    .map_err(framework_error)?;
                summary.record(Category::Channel, name);
            }
        }
        Ok(())
    }

    fn load_chains(&self, map: &PropertyMap, summary: &mut ChangeSummary) -> Result<()> {
        for name in map.names(Category::Chain) {
            let key = Category::Chain.key(name);
            let Some(spec) = map.chain(name)? else {
                continue;
            };
            let framework_error = |source| ConfigError::framework(&key, source);
            let channels: Vec<&str> = spec.channels.iter().map(String::as_str).collect();

            let existing = match self.framework.get_chain(name) {
                Some(existing) if existing.flow() != spec.flow => {
                    self.framework.remove_chain(name).map_err(framework_error)?;
                    None
                }
                other => other,
            };

            let Some(existing) = existing else {
                let admitted = self
                    .framework
                    .add_chain(name, spec.flow, &channels)
                    .map_err(framework_error)?;
                if admitted.is_none() {
                    info!(chain = name, "chain not admitted; skipped");
                    continue;
                }
                if !spec.enabled {
                    self.framework
                        .set_chain_enabled(name, false)
                        .map_err(framework_error)?;
                }
                summary.record(Category::Chain, name);
                continue;
            };

            if existing.channels() != spec.channels.as_slice() {
                self.framework
                    .update_chain(name, &channels)
                    .map_err(framework_error)?;
                summary.record(Category::Chain, name);
            }
            if existing.is_enabled() != spec.enabled {
                self.framework
                    .set_chain_enabled(name, spec.enabled)
                    .map_err(framework_error)?;
                summary.record(Category::Chain, name);
            }
        }
        Ok(())
    }

    fn load_groups(&self, map: &PropertyMap, summary: &mut ChangeSummary) -> Result<()> {
        for name in map.names(Category::Group) {
            let key = Category::Group.key(name);
            let Some(chains) = map.group(name)? else {
                continue;
            };
            let chains: Vec<&str> = chains.iter().map(String::as_str).collect();
            let result = match self.framework.get_chain_group(name) {
                None => self.framework.add_chain_group(name, &chains),
                Some(existing) if existing.chains() == chains.as_slice() => continue,
                Some(_) => self.framework.update_chain_group(name, &chains),
            };
            result.map_err(|source| ConfigError::framework(&key, source))?;
            summary.record(Category::Group, name);
        }
        Ok(())
    }

    /// 以新表替换旧表，并按需重启入站链。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：配置热更新时只停掉必须重建的链，其余运行链不受影响；
    /// - **契约 (What)**：
    ///   - 旧表独有的链先停止、销毁再移除，旧表独有的链组、通道与端点随后移除；
    ///   - 通道列表或流向变化的链，以及引用了工厂类型变化的通道的链，视为需要重建；
    ///   - 重建前处于 `STARTED`/`QUIESCED` 的入站链在应用新表后重新启动，
    ///     新表新增且启用的入站链被启动；
    ///   - 返回值合并了删除、应用与启动三个阶段的变化；
    /// - **风险 (Trade-offs)**：首个失败即返回，框架可能停在新旧配置之间的中间状态。
    #[instrument(skip_all)]
    pub fn start_config(&self, old: &PropertyMap, new: &PropertyMap) -> Result<ChangeSummary> {
        let mut summary = ChangeSummary::default();
        self.remove_stale(old, new, &mut summary)?;

        let rebuild = self.chains_to_rebuild(old, new)?;
        let mut restart = Vec::new();
        for name in &rebuild {
            let state = self.chain_state(name);
            if state == RuntimeState::Uninitialized || !self.is_inbound(name) {
                continue;
            }
            self.tear_down(name)?;
            if state.is_running() {
                restart.push(name.clone());
            }
        }

        summary.merge(self.load(new)?);

        let added = new
            .names(Category::Chain)
            .into_iter()
            .filter(|name| old.get(&Category::Chain.key(name)).is_none())
            .map(str::to_owned);
        for name in restart.into_iter().chain(added) {
            let Some(chain) = self.framework.get_chain(&name) else {
                continue;
            };
            if chain.flow() != FlowType::Inbound || !chain.is_enabled() {
                continue;
            }
            if self.framework.is_chain_running(&name) {
                continue;
            }
            self.framework
                .start_chain(&name)
                .map_err(|source| ConfigError::framework(&Category::Chain.key(&name), source))?;
            info!(chain = %name, "chain started from configuration");
            summary.record(Category::Chain, &name);
        }
        Ok(summary)
    }

    fn remove_stale(
        &self,
        old: &PropertyMap,
        new: &PropertyMap,
        summary: &mut ChangeSummary,
    ) -> Result<()> {
        let stale = |category: Category| -> Vec<String> {
            old.names(category)
                .into_iter()
                .filter(|name| new.get(&category.key(name)).is_none())
                .map(str::to_owned)
                .collect()
        };

        for name in stale(Category::Group) {
            if self.framework.get_chain_group(&name).is_some() {
                self.framework
                    .remove_chain_group(&name)
                    .map_err(|source| ConfigError::framework(&Category::Group.key(&name), source))?;
                summary.record(Category::Group, &name);
            }
        }
        for name in stale(Category::Chain) {
            if self.framework.get_chain(&name).is_none() {
                continue;
            }
            if self.chain_state(&name) != RuntimeState::Uninitialized && self.is_inbound(&name) {
                self.tear_down(&name)?;
            }
            self.framework
                .remove_chain(&name)
                .map_err(|source| ConfigError::framework(&Category::Chain.key(&name), source))?;
            summary.record(Category::Chain, &name);
        }
        for name in stale(Category::Channel) {
            if self.framework.get_channel(&name).is_some() {
                self.framework
                    .remove_channel(&name)
                    .map_err(|source| ConfigError::framework(&Category::Channel.key(&name), source))?;
                summary.record(Category::Channel, &name);
            }
        }
        for name in stale(Category::Factory) {
            if self.framework.lookup_factory(&name).is_some() {
                self.framework
                    .update_all_channel_factory_properties(&name, Default::default())
                    .map_err(|source| ConfigError::framework(&Category::Factory.key(&name), source))?;
                summary.record(Category::Factory, &name);
            }
        }
        for name in stale(Category::Endpoint) {
            if self.framework.endpoints().remove(&name).is_some() {
                summary.record(Category::Endpoint, &name);
            }
        }
        Ok(())
    }

    /// 结构性变化波及的链。
    fn chains_to_rebuild(&self, old: &PropertyMap, new: &PropertyMap) -> Result<BTreeSet<String>> {
        let mut retyped = BTreeSet::new();
        for name in new.names(Category::Channel) {
            if let (Some(before), Some(after)) = (old.channel(name)?, new.channel(name)?)
                && before.factory_type != after.factory_type
            {
                retyped.insert(name.to_owned());
            }
        }

        let mut rebuild = BTreeSet::new();
        for name in new.names(Category::Chain) {
            let Some(after) = new.chain(name)? else {
                continue;
            };
            let changed = match old.chain(name)? {
                Some(before) => before.channels != after.channels || before.flow != after.flow,
                None => false,
            };
            if changed || after.channels.iter().any(|channel| retyped.contains(channel)) {
                rebuild.insert(name.to_owned());
            }
        }
        Ok(rebuild)
    }

    fn chain_state(&self, name: &str) -> RuntimeState {
        self.framework
            .get_chain_state(name)
            .unwrap_or(RuntimeState::Uninitialized)
    }

    fn is_inbound(&self, name: &str) -> bool {
        self.framework
            .get_chain(name)
            .is_some_and(|chain| chain.flow() == FlowType::Inbound)
    }

    /// 出站链由虚拟连接工厂的引用计数驱动，这里只处理入站链。
    fn tear_down(&self, name: &str) -> Result<()> {
        let key = Category::Chain.key(name);
        if self.chain_state(name).is_running() {
            self.framework
                .stop_chain(name, 0)
                .map_err(|source| ConfigError::framework(&key, source))?;
        }
        self.framework
            .destroy_chain(name)
            .map_err(|source| ConfigError::framework(&key, source))?;
        debug!(chain = name, "chain torn down for reconfiguration");
        Ok(())
    }
}
