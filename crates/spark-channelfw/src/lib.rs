//! # spark-channelfw
//!
//! ## 定位与职责（Why）
//! - 可插拔协议栈运行时：把外部实现的“通道”按流向装配成“链”，驱动链的生命周期，
//!   并在多条入站链共享同一传输通道时逐连接甄别数据的归属；
//! - 以显式构造的 [`ChannelFramework`] 句柄承载全部状态，取代隐藏的全局单例。
//!
//! ## 架构嵌入（Where）
//! - `registry` 模块定义通道、链、链组配置快照与链连贯性校验；
//! - `framework` 模块承载注册表、生命周期状态机、链组批量操作与出站虚拟连接工厂；
//! - `discrimination` 模块实现按权重排序的“YES/NO/MAYBE”甄别流程；
//! - `time` 模块提供静默定时服务（Tokio 实现与手动推进的测试实现）；
//! - `settings` 模块收敛框架级参数与链组启动重试策略。
//!
//! ## 风险提示（Trade-offs）
//! - 所有变更操作共享一把粗粒度锁，通道与工厂钩子在锁内同步执行；
//!   钩子阻塞会阻塞所有调用方，钩子本身不设超时。

pub mod channel;
pub mod connection;
pub mod discrimination;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod framework;
pub mod listener;
pub mod policy;
pub mod registry;
pub mod settings;
pub mod time;
pub mod types;

/// 测试桩：记录型工厂、通道、甄别器与监听器。
///
/// - **意图说明 (Why)**：单元测试与集成测试共用同一套桩，避免在各测试文件中重复定义；
/// - **风险提示 (Trade-offs)**：随 crate 公开，仅供测试与示例使用。
pub mod test_stubs;

pub use channel::Channel;
pub use connection::{InboundVcFactory, VirtualConnection};
pub use discrimination::{
    ConnectionLink, DeviceLink, DiscriminationHandle, DiscriminationProcess,
    DiscriminationStatus, Discriminator, Vote,
};
pub use endpoint::{CfEndPoint, EndPointCriteria, Endpoint, EndpointRegistry, OutboundChannelDef};
pub use error::{ChannelError, ErrorCategory, FrameworkError, Result};
pub use factory::{ChannelFactory, ChannelFactoryData, FactoryConstructor, FactoryDescriptor};
pub use framework::{ChainFilter, ChannelFramework, ChannelFrameworkBuilder, OutboundVcFactory};
pub use listener::{ALL_CHAINS, ChainEvent, ChainEventListener};
pub use policy::{AdmitAll, ChainAdmissionPolicy};
pub use registry::{ChainConfig, ChainGroupConfig, ChannelConfig};
pub use settings::{ChainStartMode, FrameworkSettings, RetryPolicy};
pub use time::{ManualTimer, TimerHandle, TimerService, TimerTask, TokioTimer};
pub use types::{DEFAULT_DISC_WEIGHT, FlowType, PropertyBag, RuntimeState, TypeToken};
