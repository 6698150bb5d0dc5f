//! 链准入策略：平台可在链装配时静默拒绝不被当前运行区域允许的链。

use crate::factory::FactoryDescriptor;
use crate::types::FlowType;

/// 链准入策略。
///
/// # 教案式说明
/// - **意图 (Why)**：某些平台只允许特定区域装配特定通道组合；规则与环境强相关，
///   因此以可插拔钩子提供，而非内置判断；
/// - **契约 (What)**：返回 `false` 时 `add_chain` 返回 `Ok(None)`，注册表保持不变，不产生错误；
///   策略在连贯性检查通过之后调用。
pub trait ChainAdmissionPolicy: Send + Sync {
    /// 是否允许装配该链。`channels` 与 `descriptors` 一一对应。
    fn admit(
        &self,
        chain: &str,
        flow: FlowType,
        channels: &[String],
        descriptors: &[&FactoryDescriptor],
    ) -> bool;
}

/// 接受所有链的默认策略。
#[derive(Clone, Copy, Debug, Default)]
pub struct AdmitAll;

impl ChainAdmissionPolicy for AdmitAll {
    fn admit(&self, _: &str, _: FlowType, _: &[String], _: &[&FactoryDescriptor]) -> bool {
        true
    }
}
