//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为通道框架对外暴露的错误语义提供集中定义：校验、连贯性、状态、可重试运行时错误
//!   与资源生命周期违规五类；
//! - 通道钩子（`init/start/stop/destroy`）的失败以 [`ChannelError`] 表达，框架在向上传播时
//!   附加链名与通道名。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 `thiserror::Error`，可与 `anyhow` 等生态直接组合；
//! - [`FrameworkError::category`] 将任一错误映射到 [`ErrorCategory`]，调用方据此决定是否
//!   重试；
//! - 组级批量操作失败时携带已生效的链列表（见 [`FrameworkError::GroupOperation`]）。

use std::borrow::Cow;

use thiserror::Error;

use crate::types::{RuntimeState, TypeToken};

/// 错误分类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    /// 参数或引用非法，注册表保持不变。
    Validation,
    /// 相邻通道或甄别器之间的类型契约不匹配。
    Coherency,
    /// 当前生命周期状态不允许该操作。
    State,
    /// 通道钩子报告的暂时性失败，可按策略重试。
    Retryable,
    /// 移除仍在使用的资源等生命周期违规。
    Resource,
}

/// 通道钩子返回的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：通道实现只需描述失败原因与是否值得重试，不关心自己处在哪条链上；
/// - **契约 (What)**：`retryable == true` 表示暂时性失败（例如端口尚被占用），组启动的
///   `RetryEachOnFail` 模式会据此重试；
/// - **风险 (Trade-offs)**：消息使用 `Cow<'static, str>`，静态文本零分配，动态文本需一次分配。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ChannelError {
    message: Cow<'static, str>,
    retryable: bool,
}

impl ChannelError {
    /// 构造不可重试的通道错误。
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// 构造可重试的通道错误。
    pub fn retryable(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// 错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 是否可重试。
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// 通道框架错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合注册表校验、连贯性检查、生命周期守卫与钩子失败，每个变体都携带
///   可读上下文（链名、通道名、状态），便于运维定位；
/// - **契约 (What)**：所有变体 `Send + Sync + 'static`；校验/连贯性/状态错误出现时注册表
///   状态保持不变；
/// - **执行逻辑 (How)**：[`category`](Self::category) 给出稳定分类，组级错误递归取其源错误分类。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FrameworkError {
    /// 通道名为空、重复或引用了不存在的通道。
    #[error("invalid channel name `{name}`: {reason}")]
    InvalidChannelName { name: String, reason: String },

    /// 新增通道时名称已存在。
    #[error("channel `{name}` already exists")]
    DuplicateChannelName { name: String },

    /// 工厂类型为空或未注册。
    #[error("invalid channel factory type `{factory_type}`: {reason}")]
    InvalidFactory {
        factory_type: String,
        reason: String,
    },

    /// 甄别权重为负。
    #[error("invalid discrimination weight {weight} for channel `{channel}`")]
    InvalidWeight { channel: String, weight: i32 },

    /// 参数缺失或为空。
    #[error("invalid argument for `{operation}`: {reason}")]
    InvalidArgument { operation: String, reason: String },

    /// 通道仍被运行中的链引用，禁止移除。
    #[error("channel `{name}` is in use by running chains; destroy them first")]
    ChannelInUse { name: String },

    /// 链名为空、未知，或接口不适用于该链（例如直接驱动出站链）。
    #[error("invalid chain name `{name}`: {reason}")]
    InvalidChainName { name: String, reason: String },

    /// 新增链时名称已存在。
    #[error("chain `{name}` already exists")]
    DuplicateChainName { name: String },

    /// 相邻通道的接口类型不匹配。
    #[error("incoherent chain `{chain}`: {detail}")]
    IncoherentChain { chain: String, detail: String },

    /// 链仍在运行表中，禁止移除。
    #[error("chain `{name}` is in use (state {state}); destroy it first")]
    ChainInUse { name: String, state: RuntimeState },

    /// 链处于活动状态，禁止更新定义。
    #[error("chain `{name}` is running (state {state}); destroy it before updating")]
    ChainRunning { name: String, state: RuntimeState },

    /// 当前状态不允许该生命周期操作。
    #[error("chain `{chain}` cannot {operation} from state {state}")]
    InvalidRuntimeState {
        chain: String,
        operation: &'static str,
        state: RuntimeState,
    },

    /// 停止超时为负。
    #[error("invalid stop timeout {millis}ms for chain `{chain}`")]
    InvalidTimer { chain: String, millis: i64 },

    /// 链组不存在或参数非法。
    #[error("chain group `{group}`: {reason}")]
    ChainGroup { group: String, reason: String },

    /// 组级批量操作在某条链上失败；`changed` 为失败前已完成迁移的链。
    #[error("group `{group}` failed on chain `{chain}` after changing {changed:?}: {source}")]
    GroupOperation {
        group: String,
        chain: String,
        changed: Vec<String>,
        #[source]
        source: Box<FrameworkError>,
    },

    /// 通道钩子失败。
    #[error("channel `{channel}` in chain `{chain}` failed during {hook}: {source}")]
    Channel {
        chain: String,
        channel: String,
        hook: &'static str,
        #[source]
        source: ChannelError,
    },

    /// 通道工厂的创建、初始化或产出通道失败。
    #[error("channel factory `{factory_type}` failed: {source}")]
    Factory {
        factory_type: String,
        #[source]
        source: ChannelError,
    },

    /// 甄别器声明的数据类型与甄别流程不一致。
    #[error("discriminator `{channel}` consumes {found}, process expects {expected}")]
    DiscriminatorTypeMismatch {
        channel: String,
        expected: TypeToken,
        found: TypeToken,
    },

    /// 甄别流程已启动，不允许增删甄别器。
    #[error("discrimination process is started; cannot {operation} discriminator `{channel}`")]
    DiscriminationProcessState {
        channel: String,
        operation: &'static str,
    },

    /// 链或端点查询失败。
    #[error("chain `{chain}`: {reason}")]
    Chain { chain: String, reason: String },

    /// 框架拆除时累积的次级错误。
    #[error("framework teardown reported errors: {0:?}")]
    Teardown(Vec<String>),
}

impl FrameworkError {
    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            FrameworkError::InvalidChannelName { .. }
            | FrameworkError::DuplicateChannelName { .. }
            | FrameworkError::InvalidFactory { .. }
            | FrameworkError::InvalidWeight { .. }
            | FrameworkError::InvalidArgument { .. }
            | FrameworkError::InvalidChainName { .. }
            | FrameworkError::DuplicateChainName { .. }
            | FrameworkError::InvalidTimer { .. }
            | FrameworkError::ChainGroup { .. }
            | FrameworkError::Chain { .. } => ErrorCategory::Validation,
            FrameworkError::IncoherentChain { .. }
            | FrameworkError::DiscriminatorTypeMismatch { .. } => ErrorCategory::Coherency,
            FrameworkError::InvalidRuntimeState { .. }
            | FrameworkError::ChainRunning { .. }
            | FrameworkError::DiscriminationProcessState { .. } => ErrorCategory::State,
            FrameworkError::ChannelInUse { .. } | FrameworkError::ChainInUse { .. } => {
                ErrorCategory::Resource
            }
            FrameworkError::Channel { source, .. } | FrameworkError::Factory { source, .. } => {
                if source.is_retryable() {
                    ErrorCategory::Retryable
                } else {
                    ErrorCategory::State
                }
            }
            FrameworkError::GroupOperation { source, .. } => source.category(),
            FrameworkError::Teardown(_) => ErrorCategory::Resource,
        }
    }

    /// 是否为可重试错误。
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Retryable
    }

    /// 是否由通道或工厂钩子抛出；状态守卫与校验错误不算一次启动尝试。
    pub fn is_hook_failure(&self) -> bool {
        matches!(
            self,
            FrameworkError::Channel { .. } | FrameworkError::Factory { .. }
        )
    }

    pub(crate) fn invalid_chain(name: &str, reason: impl Into<String>) -> Self {
        FrameworkError::InvalidChainName {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_channel(name: &str, reason: impl Into<String>) -> Self {
        FrameworkError::InvalidChannelName {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn group(group: &str, reason: impl Into<String>) -> Self {
        FrameworkError::ChainGroup {
            group: group.to_owned(),
            reason: reason.into(),
        }
    }
}

/// 框架操作的统一返回类型。
pub type Result<T, E = FrameworkError> = std::result::Result<T, E>;
