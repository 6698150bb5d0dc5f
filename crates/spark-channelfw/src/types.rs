//! # 基础类型：流向、运行态与类型令牌
//!
//! ## 核心意图（Why）
//! - 通道、链、甄别流程都需要共享一组轻量的值类型：链的流向、生命周期状态，以及
//!   相邻通道之间做连贯性校验时使用的“接口类型令牌”；
//! - 将它们集中在一个模块中，避免注册表、状态机与甄别引擎之间出现循环依赖。
//!
//! ## 行为契约（What）
//! - [`FlowType`]：链的方向，入站链由设备侧向应用侧排列，出站链反之；
//! - [`RuntimeState`]：链/通道的生命周期，`rank` 给出“共享通道取最高态”时的比较次序；
//! - [`TypeToken`]：基于 [`TypeId`] 的类型令牌，既用于装配期连贯性校验，也用于甄别期
//!   的运行时数据类型检查。

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;

/// 通道属性包：字符串键到字符串值的有序映射。
///
/// 配置装载器产出的全部属性都是字符串；通道工厂自行解析数值或布尔值。
pub type PropertyBag = BTreeMap<String, String>;

/// 未显式指定时使用的甄别权重。
pub const DEFAULT_DISC_WEIGHT: i32 = 10;

/// 通道属性中表示监听端口的键。
pub const PROPERTY_PORT: &str = "port";
/// 端口被动态分配时，通道回写的实际监听端口键。
pub const PROPERTY_LISTENING_PORT: &str = "listeningPort";
/// 通道属性中表示主机名的键。
pub const PROPERTY_HOST_NAME: &str = "hostname";
/// 通道属性中引用端点注册表条目的键。
pub const PROPERTY_ENDPOINT: &str = "endpoint";
/// 设备侧通道属性中列出所服务虚拟主机的键，取值以逗号分隔。
pub const PROPERTY_VIRTUAL_HOSTS: &str = "virtualHosts";

/// 链的流向。
///
/// # 教案式说明
/// - **意图 (Why)**：入站链以设备侧通道开头，出站链以应用侧通道开头，连贯性校验与
///   生命周期驱动都依赖这一方向；
/// - **契约 (What)**：仅两个取值，满足 `Copy + Eq + Hash`，可直接作为表键。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum FlowType {
    /// 接受外部连接，数据自设备侧流向应用侧。
    Inbound,
    /// 主动发起连接，数据自应用侧流向设备侧。
    Outbound,
}

impl FlowType {
    /// 以配置文本（`inbound`/`outbound`，大小写不敏感）解析流向。
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(FlowType::Inbound),
            "outbound" => Some(FlowType::Outbound),
            _ => None,
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowType::Inbound => f.write_str("inbound"),
            FlowType::Outbound => f.write_str("outbound"),
        }
    }
}

/// 链与通道的生命周期状态。
///
/// # 教案式说明
/// - **意图 (Why)**：驱动 `init → start → stop → destroy` 状态机，并为共享通道计算
///   “所有引用链中的最高态”；
/// - **契约 (What)**：[`rank`](Self::rank) 的次序为
///   `Uninitialized < Initialized < Quiesced < Started`；
/// - **风险 (Trade-offs)**：`Quiesced` 排在 `Initialized` 之上，因为静默中的通道仍在
///   处理存量连接，不能被其他链的停止动作拆除。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RuntimeState {
    /// 未进入运行表。
    Uninitialized,
    /// 已初始化，尚未对外服务。
    Initialized,
    /// 正在对外服务。
    Started,
    /// 定时停止中：不再接受新工作，等待存量工作排空。
    Quiesced,
}

impl RuntimeState {
    /// 共享通道比较用的次序值。
    pub fn rank(self) -> u8 {
        match self {
            RuntimeState::Uninitialized => 0,
            RuntimeState::Initialized => 1,
            RuntimeState::Quiesced => 2,
            RuntimeState::Started => 3,
        }
    }

    /// 是否处于 `Started` 或 `Quiesced`。
    pub fn is_running(self) -> bool {
        matches!(self, RuntimeState::Started | RuntimeState::Quiesced)
    }

    /// 取两者中次序更高的状态。
    pub fn max(self, other: RuntimeState) -> RuntimeState {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RuntimeState::Uninitialized => "UNINITIALIZED",
            RuntimeState::Initialized => "INITIALIZED",
            RuntimeState::Started => "STARTED",
            RuntimeState::Quiesced => "QUIESCED",
        };
        f.write_str(text)
    }
}

/// 接口类型令牌。
///
/// # 教案式说明
/// - **意图 (Why)**：通道工厂需要声明“向上提供什么接口、向下接受什么接口”，甄别器需要
///   声明“消费哪种甄别数据”。以 [`TypeId`] 作为身份，既能在装配期比较，也能在运行期
///   对 `&dyn Any` 数据做类型检查；
/// - **契约 (What)**：相等性只看 `TypeId`，`name` 仅用于诊断输出；
/// - **执行 (How)**：通过 [`TypeToken::of`] 以具体类型构造。
#[derive(Clone, Copy)]
pub struct TypeToken {
    id: TypeId,
    name: &'static str,
}

impl TypeToken {
    /// 以类型 `T` 构造令牌。
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// 类型名称，仅供诊断。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 判断运行期数据是否属于该类型。
    pub fn matches(&self, data: &dyn Any) -> bool {
        data.type_id() == self.id
    }
}

impl PartialEq for TypeToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeToken {}

impl std::hash::Hash for TypeToken {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeToken({})", self.name)
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_channel_rank_orders_started_above_quiesced() {
        assert_eq!(
            RuntimeState::Initialized.max(RuntimeState::Started),
            RuntimeState::Started
        );
        assert_eq!(
            RuntimeState::Started.max(RuntimeState::Quiesced),
            RuntimeState::Started
        );
        assert_eq!(
            RuntimeState::Initialized.max(RuntimeState::Quiesced),
            RuntimeState::Quiesced
        );
    }

    #[test]
    fn type_token_matches_runtime_data() {
        let token = TypeToken::of::<Vec<u8>>();
        let data: Vec<u8> = vec![1, 2, 3];
        assert!(token.matches(&data));
        assert!(!token.matches(&"text"));
        assert_eq!(token, TypeToken::of::<Vec<u8>>());
    }

    #[test]
    fn flow_type_parses_case_insensitively() {
        assert_eq!(FlowType::parse(" Inbound "), Some(FlowType::Inbound));
        assert_eq!(FlowType::parse("OUTBOUND"), Some(FlowType::Outbound));
        assert_eq!(FlowType::parse("sideways"), None);
    }
}
