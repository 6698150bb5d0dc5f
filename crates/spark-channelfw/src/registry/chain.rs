use crate::error::{FrameworkError, Result};
use crate::factory::FactoryDescriptor;
use crate::types::FlowType;

/// 链配置快照。
///
/// # 教案式说明
/// - **意图 (Why)**：链只按名称引用通道，不拥有通道配置；同一通道可以出现在多条链中；
/// - **契约 (What)**：`channels` 非空且按管线顺序排列：入站链自设备侧至应用侧，
///   出站链自应用侧至设备侧；
/// - **风险 (Trade-offs)**：`enabled == false` 的链保留在注册表中，但启动操作会跳过它。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainConfig {
    name: String,
    flow: FlowType,
    channels: Vec<String>,
    enabled: bool,
}

impl ChainConfig {
    pub(crate) fn new(name: &str, flow: FlowType, channels: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            flow,
            channels,
            enabled: true,
        }
    }

    /// 链名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 链流向。
    pub fn flow(&self) -> FlowType {
        self.flow
    }

    /// 按管线顺序排列的通道名。
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// 是否包含指定通道。
    pub fn contains_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|name| name == channel)
    }

    /// 是否启用。
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 设备侧通道名：入站链首、出站链尾。
    pub fn device_channel(&self) -> Option<&str> {
        let channel = match self.flow {
            FlowType::Inbound => self.channels.first(),
            FlowType::Outbound => self.channels.last(),
        };
        channel.map(String::as_str)
    }

    pub(crate) fn set_channels(&mut self, channels: Vec<String>) {
        self.channels = channels;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// 校验相邻通道的接口契约。
///
/// `descriptors` 与链的通道列表一一对应。入站链自首个通道向上检查：首个通道必须面向设备，
/// 其后每个通道都要接受下方邻居的应用侧接口；出站链按相反的邻接方向执行同样的检查，
/// 末尾通道必须面向设备。
pub(crate) fn check_coherency(
    chain: &str,
    flow: FlowType,
    channels: &[String],
    descriptors: &[&FactoryDescriptor],
) -> Result<()> {
    let incoherent = |detail: String| FrameworkError::IncoherentChain {
        chain: chain.to_owned(),
        detail,
    };

    // 统一成“设备侧在前”的顺序后再检查。
    let mut ordered: Vec<(&str, &FactoryDescriptor)> = channels
        .iter()
        .map(String::as_str)
        .zip(descriptors.iter().copied())
        .collect();
    if flow == FlowType::Outbound {
        ordered.reverse();
    }

    let Some((device_name, device)) = ordered.first() else {
        return Err(incoherent("chain has no channels".into()));
    };
    if !device.is_device_facing() {
        return Err(incoherent(format!(
            "device-side channel `{device_name}` is not device facing"
        )));
    }

    for pair in ordered.windows(2) {
        let (lower_name, lower) = pair[0];
        let (upper_name, upper) = pair[1];
        if upper.is_device_facing() {
            return Err(incoherent(format!(
                "channel `{upper_name}` is device facing but follows `{lower_name}`"
            )));
        }
        if !upper.accepts(lower.application_interface) {
            return Err(incoherent(format!(
                "channel `{upper_name}` does not accept {} exposed by `{lower_name}`",
                lower.application_interface
            )));
        }
    }
    Ok(())
}
