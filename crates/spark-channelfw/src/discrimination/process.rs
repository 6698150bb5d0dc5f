use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::{DeviceLink, DiscriminationStatus, Discriminator, Vote};
use crate::connection::VirtualConnection;
use crate::error::{FrameworkError, Result};
use crate::types::TypeToken;

struct Entry {
    discriminator: Arc<dyn Discriminator>,
    weight: i32,
}

/// 甄别流程。
///
/// # 教案式说明
/// - **意图 (Why)**：为共享传输通道维护一组按权重排序的甄别器，并对每个连接执行投票协议；
/// - **契约 (What)**：
///   - 甄别器按权重降序排列，同权重保持加入顺序；
///   - 所有甄别器的数据类型必须等于流程的数据类型，否则拒绝加入；
///   - 启动后列表冻结，增删返回 [`FrameworkError::DiscriminationProcessState`]；
/// - **执行 (How)**：框架以写时复制的方式维护运行通道上的流程：复制未启动副本、修改、
///   启动后整体替换，正在使用旧流程的连接不受影响。
pub struct DiscriminationProcess {
    data_type: TypeToken,
    entries: Vec<Entry>,
    started: bool,
}

impl DiscriminationProcess {
    /// 以数据类型创建空流程。
    pub fn new(data_type: TypeToken) -> Self {
        Self {
            data_type,
            entries: Vec::new(),
            started: false,
        }
    }

    /// 流程消费的数据类型。
    pub fn data_type(&self) -> TypeToken {
        self.data_type
    }

    /// 是否已启动。
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// 冻结甄别器列表。
    pub fn start(&mut self) {
        self.started = true;
    }

    /// 甄别器数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何甄别器。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按询问顺序返回 `(通道名, 权重)`。
    pub fn discriminators(&self) -> Vec<(String, i32)> {
        self.entries
            .iter()
            .map(|entry| (entry.discriminator.channel_name().to_owned(), entry.weight))
            .collect()
    }

    /// 是否包含指定通道的甄别器。
    pub fn contains(&self, channel: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.discriminator.channel_name() == channel)
    }

    /// 加入甄别器；同名通道已存在时以新权重替换。
    pub fn add(&mut self, discriminator: Arc<dyn Discriminator>, weight: i32) -> Result<()> {
        let channel = discriminator.channel_name().to_owned();
        if self.started {
            return Err(FrameworkError::DiscriminationProcessState {
                channel,
                operation: "add",
            });
        }
        if weight < 0 {
            return Err(FrameworkError::InvalidWeight { channel, weight });
        }
        let found = discriminator.discriminatory_type();
        if found != self.data_type {
            return Err(FrameworkError::DiscriminatorTypeMismatch {
                channel,
                expected: self.data_type,
                found,
            });
        }
        self.entries
            .retain(|entry| entry.discriminator.channel_name() != channel);
        let position = self
            .entries
            .iter()
            .position(|entry| entry.weight < weight)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            position,
            Entry {
                discriminator,
                weight,
            },
        );
        Ok(())
    }

    /// 移除指定通道的甄别器，返回是否确有移除。
    pub fn remove(&mut self, channel: &str) -> Result<bool> {
        if self.started {
            return Err(FrameworkError::DiscriminationProcessState {
                channel: channel.to_owned(),
                operation: "remove",
            });
        }
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.discriminator.channel_name() != channel);
        Ok(before != self.entries.len())
    }

    /// 复制出一个未启动的副本，供写时复制修改。
    pub fn unstarted_copy(&self) -> Self {
        Self {
            data_type: self.data_type,
            entries: self
                .entries
                .iter()
                .map(|entry| Entry {
                    discriminator: Arc::clone(&entry.discriminator),
                    weight: entry.weight,
                })
                .collect(),
            started: false,
        }
    }

    /// 对一个连接执行投票协议。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 数据缺失或类型不符时直接返回 `Failure`，不询问任何甄别器；
    ///   - 依权重降序询问此前未投 NO 的甄别器，首个 YES 立即绑定链路并返回 `Success`；
    ///   - 扫描结束仍有 MAYBE 时保存投票并返回 `Again`，否则返回 `Failure`；
    ///   - `Success`/`Failure` 都会清除连接上的投票状态，`Again` 保留之；
    /// - **风险 (Trade-offs)**：投票以通道名为键，因此在两次调用之间替换流程（例如新增甄别器）
    ///   不会丢失已记录的 NO。
    pub fn discriminate(
        &self,
        vc: &VirtualConnection,
        data: Option<&dyn Any>,
        link: &mut DeviceLink,
    ) -> DiscriminationStatus {
        let Some(data) = data else {
            vc.clear_discrimination_state();
            return DiscriminationStatus::Failure;
        };
        if !self.data_type.matches(data) {
            trace!(expected = %self.data_type, "discrimination data has unexpected type");
            vc.clear_discrimination_state();
            return DiscriminationStatus::Failure;
        }

        let mut votes: HashMap<String, Vote> = vc.take_discrimination_state().unwrap_or_default();
        let mut undecided = false;
        for entry in &self.entries {
            let channel = entry.discriminator.channel_name();
            if votes.get(channel) == Some(&Vote::No) {
                continue;
            }
            match entry.discriminator.discriminate(vc, data) {
                Vote::Yes => {
                    link.set_application_link(entry.discriminator.connection_link(vc));
                    trace!(channel, vc = vc.id(), "discrimination selected channel");
                    return DiscriminationStatus::Success;
                }
                Vote::Maybe => {
                    votes.insert(channel.to_owned(), Vote::Maybe);
                    undecided = true;
                }
                Vote::No => {
                    votes.insert(channel.to_owned(), Vote::No);
                }
            }
        }

        if undecided {
            vc.store_discrimination_state(votes);
            DiscriminationStatus::Again
        } else {
            DiscriminationStatus::Failure
        }
    }
}

impl fmt::Debug for DiscriminationProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscriminationProcess")
            .field("data_type", &self.data_type)
            .field("discriminators", &self.discriminators())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::test_stubs::StubDiscriminator;

    fn process(votes: &[(&str, Vote, i32)]) -> DiscriminationProcess {
        let mut process = DiscriminationProcess::new(TypeToken::of::<Bytes>());
        for (name, vote, weight) in votes {
            process
                .add(Arc::new(StubDiscriminator::fixed(name, *vote)), *weight)
                .expect("add discriminator");
        }
        process
    }

    #[test]
    fn highest_weight_yes_wins() {
        let process = process(&[("low", Vote::Yes, 1), ("high", Vote::Yes, 20), ("mid", Vote::No, 10)]);
        let vc = VirtualConnection::detached(1);
        let mut link = DeviceLink::new();
        let data = Bytes::from_static(b"GET /");
        assert_eq!(
            process.discriminate(&vc, Some(&data), &mut link),
            DiscriminationStatus::Success
        );
        let chosen = link.application_link().expect("link bound");
        assert_eq!(chosen.channel_name(), "high");
        assert!(!vc.has_discrimination_state());
    }

    #[test]
    fn maybe_votes_yield_again_and_keep_state() {
        let process = process(&[("a", Vote::Maybe, 10), ("b", Vote::No, 9)]);
        let vc = VirtualConnection::detached(2);
        let mut link = DeviceLink::new();
        let data = Bytes::from_static(b"x");
        assert_eq!(
            process.discriminate(&vc, Some(&data), &mut link),
            DiscriminationStatus::Again
        );
        assert!(vc.has_discrimination_state());
        assert!(link.application_link().is_none());
    }

    #[test]
    fn unanimous_no_fails_and_clears() {
        let process = process(&[("a", Vote::No, 10), ("b", Vote::No, 9)]);
        let vc = VirtualConnection::detached(3);
        let mut link = DeviceLink::new();
        let data = Bytes::from_static(b"x");
        assert_eq!(
            process.discriminate(&vc, Some(&data), &mut link),
            DiscriminationStatus::Failure
        );
        assert!(!vc.has_discrimination_state());
    }

    #[test]
    fn unexpected_data_fails_without_voting() {
        let probe = Arc::new(StubDiscriminator::fixed("a", Vote::Yes));
        let mut process = DiscriminationProcess::new(TypeToken::of::<Bytes>());
        process.add(probe.clone(), 10).expect("add");
        let vc = VirtualConnection::detached(4);
        let mut link = DeviceLink::new();

        assert_eq!(
            process.discriminate(&vc, Some(&"text"), &mut link),
            DiscriminationStatus::Failure
        );
        assert_eq!(process.discriminate(&vc, None, &mut link), DiscriminationStatus::Failure);
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn started_process_is_frozen() {
        let mut process = process(&[("a", Vote::Yes, 10)]);
        process.start();
        let err = process
            .add(Arc::new(StubDiscriminator::fixed("b", Vote::No)), 1)
            .expect_err("frozen");
        assert!(matches!(err, FrameworkError::DiscriminationProcessState { .. }));
        assert!(process.remove("a").is_err());

        let mut copy = process.unstarted_copy();
        copy.add(Arc::new(StubDiscriminator::fixed("b", Vote::No)), 1)
            .expect("copy is editable");
        assert_eq!(copy.len(), 2);
        assert_eq!(process.len(), 1);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let mut process = DiscriminationProcess::new(TypeToken::of::<String>());
        let err = process
            .add(Arc::new(StubDiscriminator::fixed("a", Vote::Yes)), 10)
            .expect_err("bytes discriminator in string process");
        assert!(matches!(err, FrameworkError::DiscriminatorTypeMismatch { .. }));
    }
}
