//! # 通道工厂契约与引用计数
//!
//! ## 核心意图（Why）
//! - 通道实现由外部协作者以“工厂类型”注册，框架只在首个通道初始化时才实例化工厂，
//!   并在最后一个使用它的运行通道销毁后释放；
//! - 工厂声明的接口令牌是链装配期连贯性检查的唯一依据。
//!
//! ## 行为契约（What）
//! - [`ChannelFactory`]：创建通道、声明应用侧/设备侧接口、接收工厂级属性；
//! - [`ChannelFactoryData`]：工厂条目的只读快照（属性、是否已实例化、引用计数）；
//! - 注册时框架会构造一次探针实例读取接口声明，之后探针被丢弃。
//!
//! ## 风险提示（Trade-offs）
//! - 工厂钩子在框架锁内执行，阻塞的 `init` 会阻塞所有注册表操作。

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{ChannelError, FrameworkError, Result};
use crate::registry::ChannelConfig;
use crate::types::{FlowType, PropertyBag, TypeToken};

/// 工厂构造器：每次调用产出一个全新的工厂实例。
pub type FactoryConstructor = Arc<dyn Fn() -> Box<dyn ChannelFactory> + Send + Sync>;

/// 通道工厂。
///
/// # 教案式说明
/// - **意图 (Why)**：把“如何创建通道”与“通道在链中的位置约束”交给外部实现；
/// - **契约 (What)**：
///   - `device_interfaces` 为空表示该通道直接面向设备（传输层），只能位于入站链首或出站链尾；
///   - `application_interface` 是该通道向上层暴露的接口，必须被相邻上层的
///     `device_interfaces` 接受；
///   - `discriminatory_type` 是该通道交给上层甄别器的数据类型，默认与应用侧接口相同；
/// - **执行 (How)**：`init` 在首个通道初始化前调用一次，`destroy` 在引用计数归零后调用。
pub trait ChannelFactory: Send {
    /// 以工厂级属性初始化。
    fn init(&mut self, data: &ChannelFactoryData) -> Result<(), ChannelError> {
        let _ = data;
        Ok(())
    }

    /// 工厂级属性在运行期被更新。
    fn update_properties(&mut self, properties: &PropertyBag) {
        let _ = properties;
    }

    /// 释放工厂资源。
    fn destroy(&mut self) {}

    /// 向上层暴露的接口类型。
    fn application_interface(&self) -> TypeToken;

    /// 可接受的下层接口类型；为空表示面向设备。
    fn device_interfaces(&self) -> Vec<TypeToken>;

    /// 交给上层甄别器的数据类型。
    fn discriminatory_type(&self) -> TypeToken {
        self.application_interface()
    }

    /// 该工厂产出的通道是否提供安全传输。
    fn is_secure(&self) -> bool {
        false
    }

    /// 为指定流向创建通道实例。
    fn create_channel(
        &mut self,
        config: &ChannelConfig,
        flow: FlowType,
    ) -> Result<Box<dyn Channel>, ChannelError>;
}

/// 注册时从探针实例读取的接口声明。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FactoryDescriptor {
    pub application_interface: TypeToken,
    pub device_interfaces: Vec<TypeToken>,
    pub discriminatory_type: TypeToken,
    pub secure: bool,
}

impl FactoryDescriptor {
    pub(crate) fn probe(factory: &dyn ChannelFactory) -> Self {
        Self {
            application_interface: factory.application_interface(),
            device_interfaces: factory.device_interfaces(),
            discriminatory_type: factory.discriminatory_type(),
            secure: factory.is_secure(),
        }
    }

    /// 是否直接面向设备。
    pub fn is_device_facing(&self) -> bool {
        self.device_interfaces.is_empty()
    }

    /// 是否接受给定的下层接口。
    pub fn accepts(&self, lower: TypeToken) -> bool {
        self.device_interfaces.contains(&lower)
    }
}

/// 工厂条目快照。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelFactoryData {
    factory_type: String,
    properties: PropertyBag,
    initialized: bool,
    ref_count: usize,
}

impl ChannelFactoryData {
    /// 工厂类型名。
    pub fn factory_type(&self) -> &str {
        &self.factory_type
    }

    /// 工厂级属性。
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// 单例是否已实例化。
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// 正在使用该工厂的运行通道数。
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }
}

/// 已注册的工厂类型。
#[derive(Clone)]
pub(crate) struct FactoryType {
    pub(crate) constructor: FactoryConstructor,
    pub(crate) descriptor: FactoryDescriptor,
}

impl FactoryType {
    pub(crate) fn new(constructor: FactoryConstructor) -> Self {
        let probe = constructor();
        let descriptor = FactoryDescriptor::probe(probe.as_ref());
        Self {
            constructor,
            descriptor,
        }
    }
}

impl fmt::Debug for FactoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryType")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// 工厂条目：属性、惰性单例与引用计数。
#[derive(Default)]
pub(crate) struct FactoryRecord {
    properties: PropertyBag,
    live: Option<Box<dyn ChannelFactory>>,
    ref_count: usize,
}

impl FactoryRecord {
    pub(crate) fn snapshot(&self, factory_type: &str) -> ChannelFactoryData {
        ChannelFactoryData {
            factory_type: factory_type.to_owned(),
            properties: self.properties.clone(),
            initialized: self.live.is_some(),
            ref_count: self.ref_count,
        }
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub(crate) fn set_properties(&mut self, properties: PropertyBag) {
        self.properties = properties;
        if let Some(live) = self.live.as_mut() {
            live.update_properties(&self.properties);
        }
    }

    pub(crate) fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// 以工厂单例创建通道；单例不存在时先构造并初始化。
    ///
    /// 成功创建的通道尚未计入引用，调用方在通道 `init` 成功后调用 [`retain`](Self::retain)。
    pub(crate) fn create_channel(
        &mut self,
        factory_type: &str,
        ty: &FactoryType,
        config: &ChannelConfig,
        flow: FlowType,
    ) -> Result<Box<dyn Channel>> {
        if self.live.is_none() {
            let mut fresh = (ty.constructor)();
            let data = self.snapshot(factory_type);
            fresh.init(&data).map_err(|source| FrameworkError::Factory {
                factory_type: factory_type.to_owned(),
                source,
            })?;
            debug!(factory = factory_type, "channel factory instantiated");
            self.live = Some(fresh);
        }
        let Some(live) = self.live.as_mut() else {
            return Err(FrameworkError::InvalidFactory {
                factory_type: factory_type.to_owned(),
                reason: "factory instance unavailable".into(),
            });
        };
        live.create_channel(config, flow)
            .map_err(|source| FrameworkError::Factory {
                factory_type: factory_type.to_owned(),
                source,
            })
    }

    pub(crate) fn retain(&mut self) {
        self.ref_count += 1;
    }

    /// 释放一次引用；归零时销毁单例。
    pub(crate) fn release(&mut self, factory_type: &str) {
        match self.ref_count {
            0 => warn!(factory = factory_type, "factory released more often than retained"),
            _ => self.ref_count -= 1,
        }
        self.discard_if_idle(factory_type);
    }

    /// 无运行通道引用时销毁单例。
    pub(crate) fn discard_if_idle(&mut self, factory_type: &str) {
        if self.ref_count == 0
            && let Some(mut live) = self.live.take()
        {
            live.destroy();
            debug!(factory = factory_type, "channel factory destroyed");
        }
    }
}
