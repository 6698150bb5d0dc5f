//! # 前缀命名空间属性表
//!
//! ## 核心意图（Why）
//! - 通道框架的配置以扁平的 `类别.名称 → ["键=值", ...]` 形式下发，与具体文件格式无关；
//! - [`PropertyMap`] 是装载器的唯一输入，TOML 只是其中一种来源。
//!
//! ## 行为契约（What）
//! - 合法类别为 `channel`、`chain`、`group`、`factory`、`endpoint`，名称不可为空；
//! - 每个条目是字符串数组，元素按第一个 `=` 切分为键与值，两侧空白被裁剪；
//! - 同一条目中重复的键以最后一次出现为准；
//! - TOML 顶层的 `[framework]` 表被反序列化为 [`FrameworkSettings`]。
//!
//! ## 使用示例（How）
//! ```toml
//! [framework]
//! chainQuiesceTimeout = 5000
//!
//! [channel]
//! tcp = ["type=tcp", "port=9080"]
//! http = ["type=http", "weight=20"]
//!
//! [chain]
//! web = ["channels=tcp, http", "flow=inbound"]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use spark_channelfw::{Endpoint, FlowType, FrameworkSettings, PropertyBag};

use crate::error::{ConfigError, Result};

/// 条目类别。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Category {
    Channel,
    Chain,
    Group,
    Factory,
    Endpoint,
}

impl Category {
    /// 全部类别。
    pub const ALL: [Category; 5] = [
        Category::Channel,
        Category::Chain,
        Category::Group,
        Category::Factory,
        Category::Endpoint,
    ];

    /// 键前缀（不含点号）。
    pub fn prefix(self) -> &'static str {
        match self {
            Category::Channel => "channel",
            Category::Chain => "chain",
            Category::Group => "group",
            Category::Factory => "factory",
            Category::Endpoint => "endpoint",
        }
    }

    /// 拼出完整键。
    pub fn key(self, name: &str) -> String {
        format!("{}.{name}", self.prefix())
    }

    /// 把完整键拆分为类别与名称。
    pub fn split(key: &str) -> Option<(Category, &str)> {
        let (prefix, name) = key.split_once('.')?;
        if name.is_empty() {
            return None;
        }
        Category::ALL
            .into_iter()
            .find(|category| category.prefix() == prefix)
            .map(|category| (category, name))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// 扁平属性表。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyMap {
    entries: BTreeMap<String, Vec<String>>,
    settings: Option<FrameworkSettings>,
}

impl PropertyMap {
    /// 创建空表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 TOML 文档。
    ///
    /// 数组直接作为条目；表按 `外层.内层` 展开，因此 `[channel] tcp = [...]` 与
    /// `"channel.tcp" = [...]` 等价。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let document: toml::Table = text.parse()?;
        let mut map = Self::new();
        for (key, value) in document {
            if key == "framework" {
                map.settings = Some(value.try_into()?);
                continue;
            }
            map.absorb(key, value)?;
        }
        Ok(map)
    }

    fn absorb(&mut self, key: String, value: toml::Value) -> Result<()> {
        match value {
            toml::Value::Table(table) => {
                for (inner, value) in table {
                    self.absorb(format!("{key}.{inner}"), value)?;
                }
                Ok(())
            }
            toml::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        toml::Value::String(text) => values.push(text),
                        _ => return Err(ConfigError::NotAnArray { key }),
                    }
                }
                self.insert(&key, values).map(|_| ())
            }
            _ => Err(ConfigError::NotAnArray { key }),
        }
    }

    /// 写入条目，返回被替换的旧值。
    pub fn insert<I, S>(&mut self, key: &str, values: I) -> Result<Option<Vec<String>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if Category::split(key).is_none() {
            return Err(ConfigError::UnknownKey {
                key: key.to_owned(),
            });
        }
        let values = values.into_iter().map(Into::into).collect();
        Ok(self.entries.insert(key.to_owned(), values))
    }

    /// 删除条目。
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(key)
    }

    /// 读取条目。
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// 指定类别下的全部名称，按字典序排列。
    pub fn names(&self, category: Category) -> Vec<&str> {
        self.entries
            .keys()
            .filter_map(|key| Category::split(key))
            .filter(|(found, _)| *found == category)
            .map(|(_, name)| name)
            .collect()
    }

    /// 条目数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.settings.is_none()
    }

    /// `[framework]` 段给出的框架设置。
    pub fn settings(&self) -> Option<&FrameworkSettings> {
        self.settings.as_ref()
    }

    /// 设置框架参数。
    pub fn set_settings(&mut self, settings: FrameworkSettings) {
        self.settings = Some(settings);
    }

    /// 把条目解析为属性包。
    pub fn attributes(&self, category: Category, name: &str) -> Result<Option<PropertyBag>> {
        let key = category.key(name);
        let Some(values) = self.entries.get(&key) else {
            return Ok(None);
        };
        let mut bag = PropertyBag::new();
        for entry in values {
            let Some((attribute, value)) = entry.split_once('=') else {
                return Err(ConfigError::MalformedEntry {
                    key,
                    entry: entry.clone(),
                });
            };
            bag.insert(attribute.trim().to_owned(), value.trim().to_owned());
        }
        Ok(Some(bag))
    }

    pub(crate) fn channel(&self, name: &str) -> Result<Option<ChannelSpec>> {
        let Some(mut bag) = self.attributes(Category::Channel, name)? else {
            return Ok(None);
        };
        let key = Category::Channel.key(name);
        let factory_type = bag
            .remove(ATTR_TYPE)
            .ok_or_else(|| ConfigError::MissingAttribute {
                key: key.clone(),
                attribute: ATTR_TYPE,
            })?;
        let weight = bag
            .remove(ATTR_WEIGHT)
            .map(|value| {
                value.parse::<i32>().map_err(|_| ConfigError::InvalidValue {
                    key: key.clone(),
                    attribute: ATTR_WEIGHT,
                    value,
                })
            })
            .transpose()?;
        Ok(Some(ChannelSpec {
            factory_type,
            weight,
            properties: bag,
        }))
    }

    pub(crate) fn chain(&self, name: &str) -> Result<Option<ChainSpec>> {
        let Some(bag) = self.attributes(Category::Chain, name)? else {
            return Ok(None);
        };
        let key = Category::Chain.key(name);
        let channels = bag
            .get(ATTR_CHANNELS)
            .map(|value| split_list(value))
            .filter(|channels| !channels.is_empty())
            .ok_or_else(|| ConfigError::MissingAttribute {
                key: key.clone(),
                attribute: ATTR_CHANNELS,
            })?;
        let flow = match bag.get(ATTR_FLOW) {
            None => FlowType::Inbound,
            Some(value) => FlowType::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                key: key.clone(),
                attribute: ATTR_FLOW,
                value: value.clone(),
            })?,
        };
        let enabled = match bag.get(ATTR_ENABLE) {
            None => true,
            Some(value) => value.parse::<bool>().map_err(|_| ConfigError::InvalidValue {
                key: key.clone(),
                attribute: ATTR_ENABLE,
                value: value.clone(),
            })?,
        };
        Ok(Some(ChainSpec {
            flow,
            channels,
            enabled,
        }))
    }

    pub(crate) fn group(&self, name: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .attributes(Category::Group, name)?
            .map(|bag| bag.get(ATTR_CHAINS).map(|value| split_list(value)).unwrap_or_default()))
    }

    pub(crate) fn endpoint(&self, name: &str) -> Result<Option<Endpoint>> {
        let Some(bag) = self.attributes(Category::Endpoint, name)? else {
            return Ok(None);
        };
        let key = Category::Endpoint.key(name);
        let host = bag.get(ATTR_HOST).cloned().unwrap_or_else(|| "*".to_owned());
        let port = bag.get(ATTR_PORT).ok_or_else(|| ConfigError::MissingAttribute {
            key: key.clone(),
            attribute: ATTR_PORT,
        })?;
        let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
            key,
            attribute: ATTR_PORT,
            value: port.clone(),
        })?;
        Ok(Some(Endpoint::new(host, port)))
    }
}

const ATTR_TYPE: &str = "type";
const ATTR_WEIGHT: &str = "weight";
const ATTR_CHANNELS: &str = "channels";
const ATTR_FLOW: &str = "flow";
const ATTR_ENABLE: &str = "enable";
const ATTR_CHAINS: &str = "chains";
const ATTR_HOST: &str = "host";
const ATTR_PORT: &str = "port";

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// 通道条目。
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ChannelSpec {
    pub(crate) factory_type: String,
    pub(crate) weight: Option<i32>,
    pub(crate) properties: PropertyBag,
}

/// 链条目。
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ChainSpec {
    pub(crate) flow: FlowType,
    pub(crate) channels: Vec<String>,
    pub(crate) enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
        "group.edge" = ["chains=web"]
        "endpoint.public" = ["host=10.0.0.1", "port=443"]

        [framework]
        chainQuiesceTimeout = 2500

        [channel]
        tcp = ["type=tcp", "port = 9080"]
        http = ["type=http", "weight=20"]

        [chain]
        web = ["channels=tcp, http", "flow=inbound", "enable=false"]
    "#;

    #[test]
    fn toml_tables_and_dotted_keys_are_equivalent() {
        let map = PropertyMap::from_toml_str(DOCUMENT).expect("parse");
        assert_eq!(map.names(Category::Channel), ["http", "tcp"]);
        assert_eq!(map.get("group.edge"), Some(&["chains=web".to_owned()][..]));
        assert_eq!(
            map.settings().expect("framework table").default_chain_quiesce_timeout(),
            2500
        );

        let tcp = map.channel("tcp").expect("valid").expect("present");
        assert_eq!(tcp.factory_type, "tcp");
        assert_eq!(tcp.properties.get("port").map(String::as_str), Some("9080"));
        assert_eq!(map.channel("http").unwrap().unwrap().weight, Some(20));

        let web = map.chain("web").expect("valid").expect("present");
        assert_eq!(web.channels, ["tcp", "http"]);
        assert_eq!(web.flow, FlowType::Inbound);
        assert!(!web.enabled);

        assert_eq!(
            map.endpoint("public").unwrap(),
            Some(Endpoint::new("10.0.0.1", 443))
        );
    }

    #[test]
    fn malformed_entries_are_reported_with_their_key() {
        let mut map = PropertyMap::new();
        map.insert("chain.broken", ["channels"]).expect("insert");
        let err = map.chain("broken").expect_err("no `=`");
        assert!(matches!(err, ConfigError::MalformedEntry { ref key, .. } if key == "chain.broken"));

        map.insert("chain.flowless", ["channels=tcp", "flow=sideways"]).expect("insert");
        assert!(matches!(
            map.chain("flowless"),
            Err(ConfigError::InvalidValue { attribute: "flow", .. })
        ));

        map.insert("channel.untyped", ["port=1"]).expect("insert");
        assert!(matches!(
            map.channel("untyped"),
            Err(ConfigError::MissingAttribute { attribute: "type", .. })
        ));
    }

    #[test]
    fn unknown_namespaces_are_rejected() {
        let mut map = PropertyMap::new();
        assert!(matches!(
            map.insert("listener.x", ["a=b"]),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(map.insert("channel.", ["a=b"]).is_err());
        assert!(matches!(
            PropertyMap::from_toml_str("\"channel.tcp\" = 5"),
            Err(ConfigError::NotAnArray { .. })
        ));
        assert!(matches!(
            PropertyMap::from_toml_str("channel = ["),
            Err(ConfigError::Toml(_))
        ));
    }
}
