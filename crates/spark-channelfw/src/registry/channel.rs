use crate::error::{FrameworkError, Result};
use crate::types::PropertyBag;

/// 通道配置快照。
///
/// # 教案式说明
/// - **意图 (Why)**：描述一个可复用的处理阶段：由哪个工厂类型产出、携带哪些属性、
///   在甄别流程中的优先级；
/// - **契约 (What)**：对外只暴露不可变快照，更新权重或属性会生成新快照并推送给运行中的
///   通道实例（见 [`crate::Channel::update`]）；
/// - **风险 (Trade-offs)**：权重以 `i32` 表达，以便在边界上观察并拒绝负值。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelConfig {
    name: String,
    factory_type: String,
    properties: PropertyBag,
    weight: i32,
}

impl ChannelConfig {
    pub(crate) fn new(
        name: &str,
        factory_type: &str,
        properties: PropertyBag,
        weight: i32,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(FrameworkError::invalid_channel(name, "channel name is empty"));
        }
        validate_weight(name, weight)?;
        Ok(Self {
            name: name.to_owned(),
            factory_type: factory_type.to_owned(),
            properties,
            weight,
        })
    }

    /// 通道名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 产出该通道的工厂类型。
    pub fn factory_type(&self) -> &str {
        &self.factory_type
    }

    /// 通道属性。
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// 读取单个属性。
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// 甄别权重，数值越大越先被询问。
    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub(crate) fn with_weight(&self, weight: i32) -> Result<Self> {
        validate_weight(&self.name, weight)?;
        let mut next = self.clone();
        next.weight = weight;
        Ok(next)
    }

    pub(crate) fn with_property(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.properties.insert(key.to_owned(), value.to_owned());
        next
    }

    pub(crate) fn with_properties(&self, properties: PropertyBag) -> Self {
        let mut next = self.clone();
        next.properties = properties;
        next
    }
}

fn validate_weight(channel: &str, weight: i32) -> Result<()> {
    if weight < 0 {
        return Err(FrameworkError::InvalidWeight {
            channel: channel.to_owned(),
            weight,
        });
    }
    Ok(())
}
