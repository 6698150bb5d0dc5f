//! # 端点注册表与链端点描述
//!
//! ## 核心意图（Why）
//! - 通道配置可以用 `endpoint=<name>` 引用逻辑端点，而不是直接写死主机与端口；
//! - [`CfEndPoint`] 向外部（例如出站客户端选择器）描述一条入站链的可达地址与安全属性，
//!   并携带重建一条连回该链的出站链所需的通道定义；
//! - [`EndPointCriteria`] 让客户端从一批端点中挑出满足接口、安全与虚拟主机要求的那些。
//!
//! ## 行为契约（What）
//! - [`EndpointRegistry`] 读多写少，使用 `DashMap` 独立于框架锁；
//! - 端点解析只在查询时发生，更新端点不会推送给运行中的通道。

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::registry::ChannelConfig;
use crate::types::{FlowType, PropertyBag, TypeToken};

/// 逻辑端点：主机与端口。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// 构造端点。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// 端点注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：把“端点名 → 地址”的映射与通道配置解耦，同一端点可被多条链引用；
/// - **契约 (What)**：`define` 覆盖同名端点并返回旧值，`resolve` 返回快照；
/// - **风险 (Trade-offs)**：`DashMap` 分片锁避免与框架锁相互等待，代价是跨多个端点的读取
///   不保证同一时刻的一致视图。
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, Endpoint>,
}

impl EndpointRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 定义或覆盖端点。
    pub fn define(&self, name: &str, endpoint: Endpoint) -> Option<Endpoint> {
        debug!(endpoint = name, host = %endpoint.host, port = endpoint.port, "endpoint defined");
        self.endpoints.insert(name.to_owned(), endpoint)
    }

    /// 删除端点。
    pub fn remove(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.remove(name).map(|(_, endpoint)| endpoint)
    }

    /// 解析端点。
    pub fn resolve(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.get(name).map(|entry| entry.value().clone())
    }

    /// 已定义的端点名，按字典序排列。
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// 端点数量。
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// 出站链中单个通道的定义：工厂类型与通道属性。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundChannelDef {
    factory_type: String,
    properties: PropertyBag,
}

impl OutboundChannelDef {
    /// 构造通道定义。
    pub fn new(factory_type: impl Into<String>, properties: PropertyBag) -> Self {
        Self {
            factory_type: factory_type.into(),
            properties,
        }
    }

    /// 工厂类型名。
    pub fn factory_type(&self) -> &str {
        &self.factory_type
    }

    /// 通道属性。
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// 已配置的通道是否满足该定义：工厂类型相同，且定义中的每个属性都以相同取值出现。
    pub(crate) fn is_satisfied_by(&self, channel: &ChannelConfig) -> bool {
        channel.factory_type() == self.factory_type
            && self
                .properties
                .iter()
                .all(|(key, value)| channel.property(key) == Some(value.as_str()))
    }
}

/// 入站链的端点描述。
///
/// # 教案式说明
/// - **意图 (Why)**：客户端拿到端点后既要判断它是否合用（接口、安全、虚拟主机），
///   也要能据此搭建一条连回去的出站链；
/// - **契约 (What)**：
///   - `accessor` 是链最上层通道向应用暴露的接口类型；
///   - `outbound_channel_defs` 按出站顺序（应用侧在前、设备侧在后）排列，设备侧定义
///     已写入解析后的主机与端口；
///   - 框架产出的端点均为本地端点，[`CfEndPoint::remote`] 用于标记从其他进程获得的端点。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CfEndPoint {
    name: String,
    host: String,
    port: u16,
    secure: bool,
    flow: FlowType,
    channels: Vec<String>,
    accessor: Option<TypeToken>,
    virtual_hosts: Vec<String>,
    local: bool,
    outbound: Vec<OutboundChannelDef>,
}

impl CfEndPoint {
    pub(crate) fn new(
        name: &str,
        address: Endpoint,
        secure: bool,
        flow: FlowType,
        channels: Vec<String>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            host: address.host,
            port: address.port,
            secure,
            flow,
            channels,
            accessor: None,
            virtual_hosts: Vec::new(),
            local: true,
            outbound: Vec::new(),
        }
    }

    pub(crate) fn with_accessor(mut self, accessor: TypeToken) -> Self {
        self.accessor = Some(accessor);
        self
    }

    pub(crate) fn with_virtual_hosts(mut self, virtual_hosts: Vec<String>) -> Self {
        self.virtual_hosts = virtual_hosts;
        self
    }

    pub(crate) fn with_outbound_defs(mut self, outbound: Vec<OutboundChannelDef>) -> Self {
        self.outbound = outbound;
        self
    }

    /// 标记为其他进程发布的端点；挑选最佳端点时本地端点优先。
    pub fn remote(mut self) -> Self {
        self.local = false;
        self
    }

    /// 对应的链名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 监听主机；未配置时为通配地址 `*`。
    pub fn address(&self) -> &str {
        &self.host
    }

    /// 监听端口。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 链中是否存在安全通道。
    pub fn is_ssl_enabled(&self) -> bool {
        self.secure
    }

    /// 链流向。
    pub fn flow(&self) -> FlowType {
        self.flow
    }

    /// 链的通道列表。
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// 链最上层通道向应用暴露的接口类型。
    pub fn accessor(&self) -> Option<TypeToken> {
        self.accessor
    }

    /// 该端点服务的虚拟主机；为空表示不区分虚拟主机。
    pub fn virtual_hosts(&self) -> &[String] {
        &self.virtual_hosts
    }

    /// 是否由本进程的框架产出。
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// 重建出站链所需的通道定义，按出站顺序排列。
    pub fn outbound_channel_defs(&self) -> &[OutboundChannelDef] {
        &self.outbound
    }

    fn serves_virtual_host(&self, host: &str) -> bool {
        self.virtual_hosts
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(host))
    }

    fn uses_factory(&self, factory_type: &str) -> bool {
        self.outbound
            .iter()
            .any(|def| def.factory_type() == factory_type)
    }
}

/// 端点筛选条件。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 指定了链名时只按名称匹配，其余条件一概忽略；
///   - 指定了虚拟主机时，先收窄到声明了该主机（不区分大小写）的端点；一个都没有时
///     退回到未声明任何虚拟主机的端点；
///   - 之后端点必须暴露相同的接口类型、安全属性与 `ssl_required` 一致，并且出站定义中
///     包含每个必需的工厂类型；
/// - **执行 (How)**：[`EndPointCriteria::select`] 保持候选顺序；
///   [`EndPointCriteria::best`] 在结果中优先取第一个本地端点，否则取第一个。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndPointCriteria {
    accessor: TypeToken,
    chain: Option<String>,
    virtual_host: Option<String>,
    ssl_required: bool,
    required_factories: Vec<String>,
}

impl EndPointCriteria {
    /// 以客户端需要的应用侧接口类型构造条件。
    pub fn new(accessor: TypeToken) -> Self {
        Self {
            accessor,
            chain: None,
            virtual_host: None,
            ssl_required: false,
            required_factories: Vec::new(),
        }
    }

    /// 只接受指定链名的端点。
    pub fn chain(mut self, name: impl Into<String>) -> Self {
        self.chain = Some(name.into());
        self
    }

    /// 优先接受服务该虚拟主机的端点。
    pub fn virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }

    /// 是否要求安全传输。
    pub fn ssl_required(mut self, required: bool) -> Self {
        self.ssl_required = required;
        self
    }

    /// 要求端点的出站定义包含该工厂类型。
    pub fn require_factory(mut self, factory_type: impl Into<String>) -> Self {
        self.required_factories.push(factory_type.into());
        self
    }

    /// 按条件筛选候选端点。
    pub fn select<'a>(&self, candidates: &'a [CfEndPoint]) -> Vec<&'a CfEndPoint> {
        if let Some(chain) = &self.chain {
            return candidates
                .iter()
                .filter(|endpoint| endpoint.name() == chain)
                .collect();
        }
        let pool: Vec<&CfEndPoint> = match &self.virtual_host {
            Some(host) => {
                let serving: Vec<&CfEndPoint> = candidates
                    .iter()
                    .filter(|endpoint| endpoint.serves_virtual_host(host))
                    .collect();
                if serving.is_empty() {
                    debug!(virtual_host = %host, "no endpoint serves virtual host; using unscoped endpoints");
                    candidates
                        .iter()
                        .filter(|endpoint| endpoint.virtual_hosts().is_empty())
                        .collect()
                } else {
                    serving
                }
            }
            None => candidates.iter().collect(),
        };
        pool.into_iter()
            .filter(|endpoint| self.admits(endpoint))
            .collect()
    }

    /// 最佳端点：筛选结果中的第一个本地端点，没有时取第一个。
    pub fn best<'a>(&self, candidates: &'a [CfEndPoint]) -> Option<&'a CfEndPoint> {
        let selected = self.select(candidates);
        selected
            .iter()
            .find(|endpoint| endpoint.is_local())
            .or_else(|| selected.first())
            .copied()
    }

    fn admits(&self, endpoint: &CfEndPoint) -> bool {
        if endpoint.accessor() != Some(self.accessor) {
            trace!(endpoint = endpoint.name(), "endpoint exposes a different accessor");
            return false;
        }
        if endpoint.is_ssl_enabled() != self.ssl_required {
            return false;
        }
        if let Some(missing) = self
            .required_factories
            .iter()
            .find(|factory_type| !endpoint.uses_factory(factory_type))
        {
            trace!(endpoint = endpoint.name(), factory = %missing, "endpoint lacks required factory");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_overwrites_and_returns_previous() {
        let registry = EndpointRegistry::new();
        assert!(registry.define("http", Endpoint::new("*", 9080)).is_none());
        let previous = registry
            .define("http", Endpoint::new("localhost", 9081))
            .expect("previous endpoint");
        assert_eq!(previous.port, 9080);
        assert_eq!(registry.resolve("http").map(|e| e.port), Some(9081));
        assert_eq!(registry.names(), ["http".to_owned()]);
        assert!(registry.remove("http").is_some());
        assert!(registry.is_empty());
    }

    struct Http;
    struct Jms;

    fn endpoint(name: &str, secure: bool, hosts: &[&str], factories: &[&str]) -> CfEndPoint {
        let defs = factories
            .iter()
            .map(|factory| OutboundChannelDef::new(*factory, PropertyBag::new()))
            .collect();
        CfEndPoint::new(name, Endpoint::new("*", 80), secure, FlowType::Inbound, Vec::new())
            .with_accessor(TypeToken::of::<Http>())
            .with_virtual_hosts(hosts.iter().map(|host| (*host).to_owned()).collect())
            .with_outbound_defs(defs)
    }

    fn names(selected: &[&CfEndPoint]) -> Vec<String> {
        selected.iter().map(|endpoint| endpoint.name().to_owned()).collect()
    }

    #[test]
    fn virtual_host_narrows_or_falls_back_to_unscoped() {
        let candidates = [
            endpoint("shop", false, &["Shop.example"], &["tcp"]),
            endpoint("admin", false, &["admin.example"], &["tcp"]),
            endpoint("any", false, &[], &["tcp"]),
        ];
        let criteria = EndPointCriteria::new(TypeToken::of::<Http>());
        assert_eq!(names(&criteria.select(&candidates)), ["shop", "admin", "any"]);

        let scoped = criteria.clone().virtual_host("shop.EXAMPLE");
        assert_eq!(names(&scoped.select(&candidates)), ["shop"]);
        let unknown = criteria.virtual_host("blog.example");
        assert_eq!(names(&unknown.select(&candidates)), ["any"]);
    }

    #[test]
    fn accessor_security_and_factories_must_all_match() {
        let candidates = [
            endpoint("plain", false, &[], &["proto", "tcp"]),
            endpoint("secure", true, &[], &["proto", "ssl"]),
            endpoint("bare", false, &[], &["tcp"]),
        ];
        let plain = EndPointCriteria::new(TypeToken::of::<Http>());
        assert_eq!(names(&plain.select(&candidates)), ["plain", "bare"]);
        let with_proto = plain.clone().require_factory("proto");
        assert_eq!(names(&with_proto.select(&candidates)), ["plain"]);
        let secure = plain.ssl_required(true);
        assert_eq!(names(&secure.select(&candidates)), ["secure"]);

        let jms = EndPointCriteria::new(TypeToken::of::<Jms>());
        assert!(jms.select(&candidates).is_empty());
        assert!(jms.best(&candidates).is_none());
    }

    #[test]
    fn best_prefers_local_then_first_and_chain_name_overrides() {
        let candidates = [
            endpoint("far", false, &[], &["tcp"]).remote(),
            endpoint("near", false, &[], &["tcp"]),
            endpoint("near2", false, &[], &["tcp"]),
        ];
        let criteria = EndPointCriteria::new(TypeToken::of::<Http>());
        assert_eq!(criteria.best(&candidates).map(CfEndPoint::name), Some("near"));
        assert_eq!(criteria.best(&candidates[..1]).map(CfEndPoint::name), Some("far"));

        // 指定链名后忽略接口与安全条件。
        let named = EndPointCriteria::new(TypeToken::of::<Jms>())
            .ssl_required(true)
            .chain("far");
        assert_eq!(named.best(&candidates).map(CfEndPoint::name), Some("far"));
    }
}
